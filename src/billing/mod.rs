//! Billing module for marketplace entitlements
//!
//! This module handles:
//! - Tier table and derived capabilities
//! - One-time 7-day trial for escort accounts
//! - Reconciling persisted tier with live payment-provider state
//! - Billing pause for high-tier profiles
//! - SQLite persistence and the Stripe read adapter

mod limits;
mod pause;
mod provider;
mod reconcile;
mod service;
mod store;
mod stripe;
mod trial;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use limits::{TierCapabilities, PAUSE_THRESHOLD};
pub use pause::{
    visibility, PauseController, PauseState, PauseStatus, DEFAULT_PAUSE_CAP, PAUSE_WINDOW_DAYS,
};
pub use provider::{
    collect_facts, OneTimePayment, PaymentProvider, ProviderError, ProviderFacts,
    RecurringSubscription,
};
pub use reconcile::{reconcile, Reconciliation};
pub use service::{EntitlementService, ServiceSettings};
pub use store::{EntitlementStore, SqliteStore, StoreError, StoredPause};
pub use stripe::{validate_api_key, StripeConfig, StripeProvider};
pub use trial::{evaluate_trial, start_trial, TrialStatus, TRIAL_DAYS};
pub use types::{
    EntitlementSnapshot, Identity, ListingSync, PaymentStatus, ProfileRecord, ProfileVisibility,
    Role, SubscriberRecord, SubscriptionType, Tier, TrialGrant,
};
