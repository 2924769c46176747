//! Billing pause
//!
//! Owners of Tier3+ profiles can hide their listing for a fixed window. The
//! profile disappears from search at once; billing keeps running until
//! `resume_at`, after which an external sweep stops it. Each billing period
//! allows `pause_cap` pauses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::limits::PAUSE_THRESHOLD;
use super::types::{ProfileVisibility, Tier};
use crate::error::EntitlementError;

/// Length of one pause
pub const PAUSE_WINDOW_DAYS: i64 = 7;

/// Pauses allowed per billing period unless configured otherwise
pub const DEFAULT_PAUSE_CAP: u32 = 3;

/// Whether the profile is currently paused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PauseStatus {
    #[default]
    Active,
    Paused {
        started_at: DateTime<Utc>,
        resume_at: DateTime<Utc>,
    },
}

/// Per-profile pause state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseState {
    pub status: PauseStatus,
    pub pauses_used_in_period: u32,
    pub pause_cap: u32,
    /// Billing period the counter belongs to
    pub period_end: Option<DateTime<Utc>>,
}

impl PauseState {
    /// Fresh state for a profile that just became eligible
    pub fn new(pause_cap: u32, period_end: Option<DateTime<Utc>>) -> Self {
        Self {
            status: PauseStatus::Active,
            pauses_used_in_period: 0,
            pause_cap,
            period_end,
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.status, PauseStatus::Paused { .. })
    }

    pub fn current_pause_started_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            PauseStatus::Paused { started_at, .. } => Some(started_at),
            PauseStatus::Active => None,
        }
    }

    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            PauseStatus::Paused { resume_at, .. } => Some(resume_at),
            PauseStatus::Active => None,
        }
    }

    /// State re-keyed to the billing period ending at `period_end`
    ///
    /// A different period end means a new period started, which resets the
    /// counter. Pause status carries over.
    pub fn for_period(&self, period_end: Option<DateTime<Utc>>) -> Self {
        if self.period_end == period_end {
            return self.clone();
        }
        debug!(
            old_period_end = ?self.period_end,
            new_period_end = ?period_end,
            "Billing period rolled over, resetting pause count"
        );
        Self {
            pauses_used_in_period: 0,
            period_end,
            ..self.clone()
        }
    }
}

/// Applies pause/resume transitions
#[derive(Debug, Clone, Copy)]
pub struct PauseController {
    pause_cap: u32,
}

impl PauseController {
    pub fn new(pause_cap: u32) -> Self {
        Self { pause_cap }
    }

    /// State to create when a profile has none yet
    pub fn initial_state(&self, period_end: Option<DateTime<Utc>>) -> PauseState {
        PauseState::new(self.pause_cap, period_end)
    }

    /// Pause `state` at `now`
    ///
    /// Pausing an already-paused profile returns it unchanged, so a repeated
    /// submission never spends a second credit.
    pub fn pause(
        &self,
        state: &PauseState,
        owning_tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<PauseState, EntitlementError> {
        if owning_tier < PAUSE_THRESHOLD {
            return Err(EntitlementError::NotEligible(format!(
                "pausing requires {} or higher, profile is {}",
                PAUSE_THRESHOLD, owning_tier
            )));
        }

        if state.is_paused() {
            return Ok(state.clone());
        }

        if state.pauses_used_in_period >= state.pause_cap {
            return Err(EntitlementError::QuotaExhausted {
                used: state.pauses_used_in_period,
                cap: state.pause_cap,
            });
        }

        Ok(PauseState {
            status: PauseStatus::Paused {
                started_at: now,
                resume_at: now + Duration::days(PAUSE_WINDOW_DAYS),
            },
            pauses_used_in_period: state.pauses_used_in_period + 1,
            ..state.clone()
        })
    }

    /// Resume a paused profile; the spent credit is not refunded
    pub fn resume(
        &self,
        state: &PauseState,
        now: DateTime<Utc>,
    ) -> Result<PauseState, EntitlementError> {
        let PauseStatus::Paused { resume_at, .. } = state.status else {
            return Err(EntitlementError::NotPaused);
        };

        debug!(early = now < resume_at, "Resuming paused profile");
        Ok(PauseState {
            status: PauseStatus::Active,
            ..state.clone()
        })
    }
}

/// Combine the entitlement tier with pause state for public display
pub fn visibility(
    tier: Tier,
    profile_active: bool,
    pause: Option<&PauseState>,
    now: DateTime<Utc>,
) -> ProfileVisibility {
    let paused = pause.map(PauseState::is_paused).unwrap_or(false);
    let billing_stopped = pause
        .and_then(PauseState::resume_at)
        .map(|resume_at| now >= resume_at)
        .unwrap_or(false);

    ProfileVisibility {
        visible: tier.capabilities().active_listing && profile_active && !paused,
        billable: !billing_stopped,
    }
}
