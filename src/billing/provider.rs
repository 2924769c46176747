//! Payment-provider read contract
//!
//! The core only ever reads from the provider: who the customer is, which
//! recurring subscriptions are live, and which one-time payments completed.
//! Checkout and any other mutation live elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Errors from the payment provider adapter
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to {operation} failed: {message}")]
    Transport { operation: String, message: String },

    #[error("request to {operation} timed out")]
    Timeout { operation: String },

    #[error("{operation} returned HTTP {status}: {message}")]
    Status {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("provider rejected credentials")]
    Unauthorized,

    #[error("could not decode {operation} response: {message}")]
    Decode { operation: String, message: String },

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

impl ProviderError {
    /// Rate limiting, server errors and timeouts are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// A live recurring subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringSubscription {
    pub id: String,
    pub period_end: DateTime<Utc>,
}

/// A completed one-time payment carrying tier metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePayment {
    pub id: String,
    pub paid_at: DateTime<Utc>,
    /// Minor currency units
    pub amount: i64,
    pub tier_tag: String,
    pub duration_days: u32,
}

impl OneTimePayment {
    /// End of the entitlement window bought by this payment
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.paid_at + Duration::days(i64::from(self.duration_days))
    }

    /// Carries usable tier metadata
    pub fn is_qualifying(&self) -> bool {
        !self.tier_tag.trim().is_empty() && self.duration_days > 0
    }
}

/// Everything the provider told us about one customer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderFacts {
    pub customer_ref: Option<String>,
    pub subscriptions: Vec<RecurringSubscription>,
    /// Most recent first
    pub payments: Vec<OneTimePayment>,
}

/// Read-only view of the payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<String>, ProviderError>;

    async fn list_active_subscriptions(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<RecurringSubscription>, ProviderError>;

    async fn list_successful_one_time_payments(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<OneTimePayment>, ProviderError>;
}

/// Gather provider state for an email
///
/// Looks the customer up by email, falling back to `known_customer` (the ref
/// stored at an earlier reconciliation) when the email no longer matches.
/// One-time payments are only fetched when there is no active subscription.
pub async fn collect_facts(
    provider: &dyn PaymentProvider,
    email: &str,
    known_customer: Option<&str>,
) -> Result<ProviderFacts, ProviderError> {
    let customer_ref = match provider.find_customer_by_email(email).await? {
        Some(found) => Some(found),
        None => known_customer.map(str::to_string),
    };

    let Some(customer) = customer_ref.clone() else {
        debug!(email = email, "No provider customer for email");
        return Ok(ProviderFacts::default());
    };

    let subscriptions = provider.list_active_subscriptions(&customer).await?;
    let mut payments = if subscriptions.is_empty() {
        provider.list_successful_one_time_payments(&customer).await?
    } else {
        Vec::new()
    };
    payments.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));

    debug!(
        customer = customer.as_str(),
        subscriptions = subscriptions.len(),
        payments = payments.len(),
        "Collected provider facts"
    );

    Ok(ProviderFacts {
        customer_ref,
        subscriptions,
        payments,
    })
}
