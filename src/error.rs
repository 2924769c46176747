//! Error taxonomy for entitlement operations
//!
//! Every reconcile/trial/pause call resolves to either a value or one of these
//! kinds. Lower layers (store, provider, config) have their own error enums and
//! convert into `EntitlementError` at the service boundary.

use crate::billing::{ProviderError, StoreError};
use crate::config::ConfigError;

/// Errors returned to callers of the entitlement service
#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Trial has already been used for this account")]
    AlreadyUsed,

    #[error("Not eligible: {0}")]
    NotEligible(String),

    #[error("Pause quota exhausted: {used}/{cap} pauses used this billing period")]
    QuotaExhausted { used: u32, cap: u32 },

    #[error("Profile is not paused")]
    NotPaused,

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
}

impl EntitlementError {
    /// Stable machine-readable kind, used as the `error` field on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidRequest(_) => "invalid_request",
            Self::AlreadyUsed => "already_used",
            Self::NotEligible(_) => "not_eligible",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::NotPaused => "not_paused",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }

    /// Whether the failure is a pure validation failure with no side effects
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Self::ProviderUnavailable(_) | Self::PersistenceFailure(_)
        )
    }
}

impl From<StoreError> for EntitlementError {
    fn from(err: StoreError) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<ProviderError> for EntitlementError {
    fn from(err: ProviderError) -> Self {
        Self::ProviderUnavailable(err.to_string())
    }
}

/// Errors that stop the service from starting
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open entitlement store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to create payment provider client: {0}")]
    Provider(#[from] ProviderError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
