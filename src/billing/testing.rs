//! Test doubles: a scripted payment provider and a contended store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::pause::PauseState;
use super::provider::{OneTimePayment, PaymentProvider, ProviderError, RecurringSubscription};
use super::store::{EntitlementStore, SqliteStore, StoreError, StoredPause};
use super::types::{ListingSync, ProfileRecord, SubscriberRecord};

/// Scripted provider: customers by email, subscriptions and payments by customer
#[derive(Default)]
pub struct FakeProvider {
    customers: HashMap<String, String>,
    subscriptions: HashMap<String, Vec<RecurringSubscription>>,
    payments: HashMap<String, Vec<OneTimePayment>>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn with_customer(mut self, email: &str, customer: &str) -> Self {
        self.customers.insert(email.to_string(), customer.to_string());
        self
    }

    pub fn with_subscription(mut self, customer: &str, id: &str, period_end: DateTime<Utc>) -> Self {
        self.subscriptions
            .entry(customer.to_string())
            .or_default()
            .push(RecurringSubscription {
                id: id.to_string(),
                period_end,
            });
        self
    }

    pub fn with_payment(
        mut self,
        customer: &str,
        id: &str,
        paid_at: DateTime<Utc>,
        duration_days: u32,
    ) -> Self {
        self.payments
            .entry(customer.to_string())
            .or_default()
            .push(OneTimePayment {
                id: id.to_string(),
                paid_at,
                amount: 9900,
                tier_tag: "platinum".to_string(),
                duration_days,
            });
        self
    }

    /// Every call fails with a transport error
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Every call sleeps before answering
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Number of provider calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ProviderError::Transport {
                operation: operation.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<String>, ProviderError> {
        self.enter("customers").await?;
        Ok(self.customers.get(email).cloned())
    }

    async fn list_active_subscriptions(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<RecurringSubscription>, ProviderError> {
        self.enter("subscriptions").await?;
        Ok(self.subscriptions.get(customer_ref).cloned().unwrap_or_default())
    }

    async fn list_successful_one_time_payments(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<OneTimePayment>, ProviderError> {
        self.enter("payment_intents").await?;
        Ok(self.payments.get(customer_ref).cloned().unwrap_or_default())
    }
}

/// SQLite store where another writer touches the pause state right before
/// each of the next `interferences` pause writes
pub struct ContendedStore {
    pub inner: SqliteStore,
    interferences: AtomicUsize,
}

impl ContendedStore {
    pub fn new(inner: SqliteStore, interferences: usize) -> Self {
        Self {
            inner,
            interferences: AtomicUsize::new(interferences),
        }
    }

    /// Bump the stored revision without changing the state
    async fn interfere(&self, profile_id: &str, incoming: &PauseState) -> Result<(), StoreError> {
        match self.inner.get_pause_state(profile_id).await? {
            Some(stored) => {
                self.inner
                    .replace_pause_state(profile_id, Some(stored.revision), &stored.state)
                    .await?;
            }
            None => {
                let initial = PauseState::new(incoming.pause_cap, incoming.period_end);
                self.inner.replace_pause_state(profile_id, None, &initial).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for ContendedStore {
    async fn get_subscriber_by_email(
        &self,
        email: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError> {
        self.inner.get_subscriber_by_email(email).await
    }

    async fn get_subscriber_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError> {
        self.inner.get_subscriber_for_owner(owner_id).await
    }

    async fn upsert_subscriber(&self, record: &SubscriberRecord) -> Result<(), StoreError> {
        self.inner.upsert_subscriber(record).await
    }

    async fn start_trial(
        &self,
        email: &str,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.start_trial(email, started_at, ends_at).await
    }

    async fn get_profile(&self, profile_id: &str) -> Result<Option<ProfileRecord>, StoreError> {
        self.inner.get_profile(profile_id).await
    }

    async fn update_owner_profiles(
        &self,
        owner_id: &str,
        sync: ListingSync,
    ) -> Result<usize, StoreError> {
        self.inner.update_owner_profiles(owner_id, sync).await
    }

    async fn persist_reconciliation(
        &self,
        owner_id: &str,
        record: &SubscriberRecord,
        sync: ListingSync,
    ) -> Result<usize, StoreError> {
        self.inner.persist_reconciliation(owner_id, record, sync).await
    }

    async fn get_pause_state(&self, profile_id: &str) -> Result<Option<StoredPause>, StoreError> {
        self.inner.get_pause_state(profile_id).await
    }

    async fn replace_pause_state(
        &self,
        profile_id: &str,
        expected_revision: Option<i64>,
        state: &PauseState,
    ) -> Result<bool, StoreError> {
        let interfere = self
            .interferences
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interfere {
            self.interfere(profile_id, state).await?;
        }
        self.inner
            .replace_pause_state(profile_id, expected_revision, state)
            .await
    }

    async fn list_due_pauses(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, PauseState)>, StoreError> {
        self.inner.list_due_pauses(now).await
    }
}
