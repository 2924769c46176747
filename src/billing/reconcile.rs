//! Entitlement reconciliation
//!
//! Folds the persisted record, the trial clock and the provider's live facts
//! into one snapshot. Pure: same inputs, same snapshot. The caller owns all IO.
//!
//! Precedence, highest first:
//! 1. a live recurring subscription (always wins over one-time payments)
//! 2. the most recent one-time payment whose window still covers `now`
//! 3. an active trial
//! 4. nothing: Basic
//!
//! A lapsed Platinum record that none of the above re-establishes is
//! explicitly downgraded.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::provider::{OneTimePayment, ProviderFacts, RecurringSubscription};
use super::trial::TrialStatus;
use super::types::{EntitlementSnapshot, SubscriberRecord, SubscriptionType, Tier};

/// Output of a reconciliation: what to return and what to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub snapshot: EntitlementSnapshot,
    /// `record` with the derived fields replaced; trial fields untouched
    pub record: SubscriberRecord,
    /// The lapsed-Platinum downgrade path fired
    pub downgraded: bool,
}

/// Compute the snapshot for `record` at `now`
pub fn reconcile(
    record: &SubscriberRecord,
    trial: &TrialStatus,
    facts: &ProviderFacts,
    now: DateTime<Utc>,
) -> Reconciliation {
    let is_expired = record.is_expired(now);

    let snapshot = if let Some(subscription) = live_subscription(&facts.subscriptions, now) {
        debug!(
            email = record.email.as_str(),
            subscription = subscription.id.as_str(),
            "Recurring subscription is authoritative"
        );
        EntitlementSnapshot::entitled(
            Tier::Platinum,
            SubscriptionType::Recurring,
            subscription.period_end,
        )
    } else if let Some(payment) = covering_payment(&facts.payments, now) {
        debug!(
            email = record.email.as_str(),
            payment = payment.id.as_str(),
            "One-time payment still covers now"
        );
        EntitlementSnapshot::entitled(Tier::Platinum, SubscriptionType::OneTime, payment.expires_at())
    } else if let (true, Some(ends_at)) = (trial.is_active, trial.ends_at) {
        EntitlementSnapshot::entitled(Tier::Trial, SubscriptionType::Trial, ends_at)
    } else {
        EntitlementSnapshot::basic()
    };

    let downgraded = is_expired && record.tier == Tier::Platinum && !snapshot.subscribed();
    let snapshot = if downgraded {
        info!(
            email = record.email.as_str(),
            expired_at = ?record.expires_at,
            "Downgrading lapsed Platinum subscriber"
        );
        EntitlementSnapshot::basic()
    } else {
        snapshot
    };

    let mut next = record.clone();
    next.tier = snapshot.tier();
    next.subscription_type = snapshot.subscription_type();
    next.expires_at = snapshot.period_end();
    next.updated_at = Some(now);
    if facts.customer_ref.is_some() {
        next.provider_customer_ref = facts.customer_ref.clone();
    }

    Reconciliation {
        snapshot,
        record: next,
        downgraded,
    }
}

/// Active subscription whose period has not already ended, latest period first
fn live_subscription(
    subscriptions: &[RecurringSubscription],
    now: DateTime<Utc>,
) -> Option<&RecurringSubscription> {
    subscriptions
        .iter()
        .filter(|s| s.period_end > now)
        .max_by_key(|s| s.period_end)
}

/// Most recent qualifying payment whose window includes `now`
///
/// Elapsed payments are skipped entirely rather than treated as errors.
fn covering_payment(payments: &[OneTimePayment], now: DateTime<Utc>) -> Option<&OneTimePayment> {
    let mut qualifying: Vec<&OneTimePayment> =
        payments.iter().filter(|p| p.is_qualifying()).collect();
    qualifying.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));
    qualifying.into_iter().find(|p| now <= p.expires_at())
}
