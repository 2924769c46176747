//! Entitlement data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::limits::TierCapabilities;
use crate::error::EntitlementError;

/// Entitlement tier
///
/// Ordered from least to most capable, so `tier >= Tier::Tier3` reads as
/// "at least Tier3".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No paid entitlement ("None" in billing exports)
    #[default]
    #[serde(alias = "none")]
    Basic,
    Trial,
    Tier1,
    Tier2,
    Tier3,
    Tier4,
    Platinum,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Trial => "trial",
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
            Self::Tier3 => "tier3",
            Self::Tier4 => "tier4",
            Self::Platinum => "platinum",
        }
    }

    /// Capability set for this tier
    pub fn capabilities(self) -> TierCapabilities {
        TierCapabilities::for_tier(self)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "none" | "" => Ok(Self::Basic),
            "trial" => Ok(Self::Trial),
            "tier1" => Ok(Self::Tier1),
            "tier2" => Ok(Self::Tier2),
            "tier3" => Ok(Self::Tier3),
            "tier4" => Ok(Self::Tier4),
            "platinum" => Ok(Self::Platinum),
            other => Err(EntitlementError::InvalidRequest(format!(
                "unknown tier '{}'",
                other
            ))),
        }
    }
}

/// How the current entitlement is being paid for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    #[default]
    Free,
    Trial,
    OneTime,
    Recurring,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Trial => "trial",
            Self::OneTime => "one_time",
            Self::Recurring => "recurring",
        }
    }
}

impl FromStr for SubscriptionType {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "trial" => Ok(Self::Trial),
            "one_time" => Ok(Self::OneTime),
            "recurring" => Ok(Self::Recurring),
            other => Err(EntitlementError::InvalidRequest(format!(
                "unknown subscription type '{}'",
                other
            ))),
        }
    }
}

/// Marketplace role of a profile owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Advertiser with a public listing; the only role offered a trial
    Escort,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escort => "escort",
            Self::Client => "client",
        }
    }
}

impl FromStr for Role {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "escort" => Ok(Self::Escort),
            "client" => Ok(Self::Client),
            other => Err(EntitlementError::InvalidRequest(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

/// Payment status mirrored onto the public profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Trial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Trial => "trial",
            Self::Paid => "paid",
        }
    }

    /// Payment status implied by a subscription type
    pub fn for_subscription(subscription_type: SubscriptionType) -> Self {
        match subscription_type {
            SubscriptionType::Free => Self::Unpaid,
            SubscriptionType::Trial => Self::Trial,
            SubscriptionType::OneTime | SubscriptionType::Recurring => Self::Paid,
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(Self::Unpaid),
            "trial" => Ok(Self::Trial),
            "paid" => Ok(Self::Paid),
            other => Err(EntitlementError::InvalidRequest(format!(
                "unknown payment status '{}'",
                other
            ))),
        }
    }
}

/// Authenticated caller
///
/// `email` is the store key, normalized (trimmed, lowercased) on
/// construction. `given_email` keeps the caller's casing for provider
/// lookups, which match email case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub given_email: String,
}

impl Identity {
    /// Build an identity, returning `None` if either part is blank
    pub fn new(id: impl Into<String>, email: impl AsRef<str>) -> Option<Self> {
        let id = id.into().trim().to_string();
        let given_email = email.as_ref().trim().to_string();
        if id.is_empty() || given_email.is_empty() {
            return None;
        }
        Some(Self {
            id,
            email: given_email.to_ascii_lowercase(),
            given_email,
        })
    }
}

/// Persisted subscriber record, one per email
///
/// `featured` and `verification_eligible` are not stored fields here: they
/// are always read off the tier so they cannot drift from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberRecord {
    pub email: String,
    pub tier: Tier,
    pub subscription_type: SubscriptionType,
    pub provider_customer_ref: Option<String>,
    /// Write-once: set by the trial clock, never cleared
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// End of the paid (or trial) period; `None` for Basic
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubscriberRecord {
    /// Default record for an email that has never been reconciled
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            tier: Tier::Basic,
            subscription_type: SubscriptionType::Free,
            provider_customer_ref: None,
            trial_started_at: None,
            trial_ends_at: None,
            expires_at: None,
            updated_at: None,
        }
    }

    pub fn featured(&self) -> bool {
        self.tier.capabilities().featured
    }

    pub fn verification_eligible(&self) -> bool {
        self.tier.capabilities().verification_eligible
    }

    /// `expires_at` is set and already in the past
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    /// Tier still in force at `now`, ignoring provider state
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        if self.tier == Tier::Basic || self.expires_at.is_none() || self.is_expired(now) {
            Tier::Basic
        } else {
            self.tier
        }
    }

    /// Snapshot of what was last persisted, as seen at `now`
    pub fn stored_snapshot(&self, now: DateTime<Utc>) -> EntitlementSnapshot {
        match (self.effective_tier(now), self.expires_at) {
            (Tier::Basic, _) | (_, None) => EntitlementSnapshot::basic(),
            (tier, Some(period_end)) => {
                EntitlementSnapshot::entitled(tier, self.subscription_type, period_end)
            }
        }
    }
}

/// Result of a reconciliation, and the wire response of `POST /reconcile`
///
/// Fields are private: a snapshot can only be built through `basic()` or
/// `entitled()`, which derive the flags from the tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSnapshot {
    subscribed: bool,
    tier: Tier,
    period_end: Option<DateTime<Utc>>,
    featured: bool,
    verification_eligible: bool,
    subscription_type: SubscriptionType,
}

impl EntitlementSnapshot {
    /// No entitlement
    pub fn basic() -> Self {
        Self::build(false, Tier::Basic, SubscriptionType::Free, None)
    }

    /// An active entitlement running until `period_end`
    pub fn entitled(
        tier: Tier,
        subscription_type: SubscriptionType,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self::build(true, tier, subscription_type, Some(period_end))
    }

    fn build(
        subscribed: bool,
        tier: Tier,
        subscription_type: SubscriptionType,
        period_end: Option<DateTime<Utc>>,
    ) -> Self {
        let caps = tier.capabilities();
        Self {
            subscribed,
            tier,
            period_end,
            featured: caps.featured,
            verification_eligible: caps.verification_eligible,
            subscription_type,
        }
    }

    pub fn subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.period_end
    }

    pub fn featured(&self) -> bool {
        self.featured
    }

    pub fn verification_eligible(&self) -> bool {
        self.verification_eligible
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.subscription_type
    }

    pub fn capabilities(&self) -> TierCapabilities {
        self.tier.capabilities()
    }
}

/// Profile fields written back after a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSync {
    pub is_active: bool,
    pub payment_status: PaymentStatus,
}

impl ListingSync {
    pub fn for_snapshot(snapshot: &EntitlementSnapshot) -> Self {
        Self {
            is_active: snapshot.capabilities().active_listing,
            payment_status: PaymentStatus::for_subscription(snapshot.subscription_type()),
        }
    }
}

/// Profile fields the entitlement core reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub id: String,
    pub owner_id: String,
    pub role: Role,
    /// Listing tier purchased through checkout (outside this service)
    pub tier: Tier,
    pub is_active: bool,
    pub payment_status: PaymentStatus,
}

/// Response to a successful trial start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialGrant {
    pub trial_end: DateTime<Utc>,
}

/// Whether a profile may be shown publicly and is still being billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileVisibility {
    pub visible: bool,
    pub billable: bool,
}
