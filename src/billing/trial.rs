//! Trial clock
//!
//! One 7-day trial per identity, ever. `trial_started_at` is written exactly
//! once; after `trial_ends_at` passes the trial is over for good, whatever
//! happens to the tier afterwards.

use chrono::{DateTime, Duration, Utc};

use super::types::SubscriberRecord;
use crate::error::EntitlementError;

/// Length of the trial window
pub const TRIAL_DAYS: i64 = 7;

/// Trial state at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialStatus {
    pub is_active: bool,
    pub ends_at: Option<DateTime<Utc>>,
}

impl TrialStatus {
    pub fn inactive() -> Self {
        Self {
            is_active: false,
            ends_at: None,
        }
    }
}

/// Whether the record's trial is running at `now`
pub fn evaluate_trial(record: &SubscriberRecord, now: DateTime<Utc>) -> TrialStatus {
    if record.trial_started_at.is_none() {
        return TrialStatus::inactive();
    }

    match record.trial_ends_at {
        Some(ends_at) => TrialStatus {
            is_active: now < ends_at,
            ends_at: Some(ends_at),
        },
        // Started but no end recorded: treat as used up
        None => TrialStatus::inactive(),
    }
}

/// Start the trial on `record`, returning the trial end
///
/// Fails with `AlreadyUsed` if a trial was ever started, even long ago.
pub fn start_trial(
    record: &mut SubscriberRecord,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, EntitlementError> {
    if record.trial_started_at.is_some() {
        return Err(EntitlementError::AlreadyUsed);
    }

    let ends_at = now + Duration::days(TRIAL_DAYS);
    record.trial_started_at = Some(now);
    record.trial_ends_at = Some(ends_at);
    Ok(ends_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_unused_trial_is_inactive() {
        let record = SubscriberRecord::new("a@example.com");
        assert_eq!(evaluate_trial(&record, t0()), TrialStatus::inactive());
    }

    #[test]
    fn test_trial_runs_seven_days() {
        let mut record = SubscriberRecord::new("a@example.com");
        let ends_at = start_trial(&mut record, t0()).unwrap();
        assert_eq!(ends_at, t0() + Duration::days(7));

        let status = evaluate_trial(&record, t0() + Duration::days(6));
        assert!(status.is_active);
        assert_eq!(status.ends_at, Some(ends_at));

        // Boundary: at ends_at the trial is over
        assert!(!evaluate_trial(&record, ends_at).is_active);
    }

    #[test]
    fn test_trial_is_single_use() {
        let mut record = SubscriberRecord::new("a@example.com");
        start_trial(&mut record, t0()).unwrap();

        let again = start_trial(&mut record, t0() + Duration::hours(1));
        assert!(matches!(again, Err(EntitlementError::AlreadyUsed)));

        // Still refused once the window has elapsed
        let later = start_trial(&mut record, t0() + Duration::days(30));
        assert!(matches!(later, Err(EntitlementError::AlreadyUsed)));
        assert_eq!(record.trial_started_at, Some(t0()));
    }
}
