//! Entitlement service
//!
//! Wires the pure pieces (trial clock, reconciler, pause controller) to the
//! store and the payment provider. Each call is one logical transaction for
//! one identity; nothing here caches entitlement state between calls.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pause::{self, PauseController, PauseState, DEFAULT_PAUSE_CAP};
use super::provider::{collect_facts, PaymentProvider};
use super::reconcile;
use super::store::EntitlementStore;
use super::trial;
use super::types::{
    EntitlementSnapshot, Identity, ListingSync, ProfileRecord, ProfileVisibility, Role,
    SubscriberRecord, Tier, TrialGrant,
};
use crate::error::EntitlementError;
use crate::rate_limit::ReconcileThrottle;

/// Read-modify-write attempts for pause state before giving up
const PAUSE_WRITE_ATTEMPTS: usize = 2;

/// Tunables for [`EntitlementService`]
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub pause_cap: u32,
    pub reconcile_max_per_minute: usize,
    /// Bound on the whole provider query of one reconcile
    pub provider_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pause_cap: DEFAULT_PAUSE_CAP,
            reconcile_max_per_minute: 30,
            provider_timeout: Duration::from_secs(10),
        }
    }
}

pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
    provider: Arc<dyn PaymentProvider>,
    throttle: ReconcileThrottle,
    pauses: PauseController,
    provider_timeout: Duration,
}

impl EntitlementService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        provider: Arc<dyn PaymentProvider>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            provider,
            throttle: ReconcileThrottle::per_minute(settings.reconcile_max_per_minute),
            pauses: PauseController::new(settings.pause_cap),
            provider_timeout: settings.provider_timeout,
        }
    }

    /// Recompute the caller's entitlement from provider state and persist it
    ///
    /// Over the throttle limit the last persisted snapshot is returned
    /// without asking the provider.
    pub async fn reconcile(
        &self,
        identity: Option<&Identity>,
        now: DateTime<Utc>,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        let identity = identity.ok_or(EntitlementError::Unauthenticated)?;
        let stored = self.store.get_subscriber_by_email(&identity.email).await?;

        if !self.throttle.allow(&identity.id) {
            debug!(identity = identity.id.as_str(), "Throttled, serving stored entitlement");
            return Ok(stored
                .map(|record| record.stored_snapshot(now))
                .unwrap_or_else(EntitlementSnapshot::basic));
        }

        let request_id = Uuid::new_v4();
        debug!(request_id = %request_id, identity = identity.id.as_str(), "Reconciling entitlement");

        let record = stored.unwrap_or_else(|| SubscriberRecord::new(identity.email.clone()));

        // The provider matches emails case-sensitively
        let query = collect_facts(
            self.provider.as_ref(),
            &identity.given_email,
            record.provider_customer_ref.as_deref(),
        );
        let facts = match tokio::time::timeout(self.provider_timeout, query).await {
            Ok(Ok(facts)) => facts,
            Ok(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "Payment provider query failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    timeout_ms = self.provider_timeout.as_millis() as u64,
                    "Payment provider query timed out"
                );
                return Err(EntitlementError::ProviderUnavailable(format!(
                    "no answer within {}ms",
                    self.provider_timeout.as_millis()
                )));
            }
        };

        let trial = trial::evaluate_trial(&record, now);
        let outcome = reconcile::reconcile(&record, &trial, &facts, now);

        let profiles = self
            .store
            .persist_reconciliation(
                &identity.id,
                &outcome.record,
                ListingSync::for_snapshot(&outcome.snapshot),
            )
            .await?;

        info!(
            request_id = %request_id,
            email = identity.email.as_str(),
            tier = %outcome.snapshot.tier(),
            subscribed = outcome.snapshot.subscribed(),
            downgraded = outcome.downgraded,
            profiles = profiles,
            "Entitlement reconciled"
        );
        Ok(outcome.snapshot)
    }

    /// Start the one-time trial for an escort account
    ///
    /// Does not reconcile; the caller reconciles to see the trial tier.
    pub async fn start_trial(
        &self,
        identity: Option<&Identity>,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialGrant, EntitlementError> {
        let identity = identity.ok_or(EntitlementError::Unauthenticated)?;
        if role.parse::<Role>()? != Role::Escort {
            return Err(EntitlementError::InvalidRequest(
                "trials are only offered to escort accounts".to_string(),
            ));
        }

        let mut record = self
            .store
            .get_subscriber_by_email(&identity.email)
            .await?
            .unwrap_or_else(|| SubscriberRecord::new(identity.email.clone()));
        let trial_end = trial::start_trial(&mut record, now)?;

        // A concurrent call may have won between the read and this write
        if !self.store.start_trial(&identity.email, now, trial_end).await? {
            return Err(EntitlementError::AlreadyUsed);
        }

        info!(email = identity.email.as_str(), trial_end = %trial_end, "Trial started");
        Ok(TrialGrant { trial_end })
    }

    /// Pause the caller's profile for one pause window
    pub async fn pause_profile(
        &self,
        identity: Option<&Identity>,
        profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PauseState, EntitlementError> {
        let identity = identity.ok_or(EntitlementError::Unauthenticated)?;
        let (profile, owner_record) = self.owned_profile(identity, profile_id).await?;
        let owning_tier = owning_tier_of(&profile, &owner_record, now);

        let state = self
            .update_pause(profile_id, owner_record.expires_at, |state| {
                self.pauses.pause(state, owning_tier, now)
            })
            .await?;
        info!(
            profile = profile_id,
            used = state.pauses_used_in_period,
            cap = state.pause_cap,
            "Profile paused"
        );
        Ok(state)
    }

    /// End the caller's pause early
    pub async fn resume_profile(
        &self,
        identity: Option<&Identity>,
        profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PauseState, EntitlementError> {
        let identity = identity.ok_or(EntitlementError::Unauthenticated)?;
        let (_, owner_record) = self.owned_profile(identity, profile_id).await?;

        let state = self
            .update_pause(profile_id, owner_record.expires_at, |state| {
                self.pauses.resume(state, now)
            })
            .await?;
        info!(profile = profile_id, "Profile resumed");
        Ok(state)
    }

    /// Whether a profile is listed and billed right now
    ///
    /// The tier is the owning tier: the listing tier or the owner's
    /// unexpired subscription, whichever is higher.
    pub async fn profile_visibility(
        &self,
        profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProfileVisibility, EntitlementError> {
        let profile = self.require_profile(profile_id).await?;
        let tier = match self.store.get_subscriber_for_owner(&profile.owner_id).await? {
            Some(owner) => owning_tier_of(&profile, &owner, now),
            None => profile.tier,
        };
        let pause = self.store.get_pause_state(profile_id).await?;
        Ok(pause::visibility(
            tier,
            profile.is_active,
            pause.as_ref().map(|stored| &stored.state),
            now,
        ))
    }

    async fn require_profile(&self, profile_id: &str) -> Result<ProfileRecord, EntitlementError> {
        self.store
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| EntitlementError::InvalidRequest(format!("unknown profile '{}'", profile_id)))
    }

    /// Load a profile the caller owns, plus the caller's subscriber record
    async fn owned_profile(
        &self,
        identity: &Identity,
        profile_id: &str,
    ) -> Result<(ProfileRecord, SubscriberRecord), EntitlementError> {
        let profile = self.require_profile(profile_id).await?;
        if profile.owner_id != identity.id {
            return Err(EntitlementError::NotEligible(
                "profile belongs to another account".to_string(),
            ));
        }

        let record = self
            .store
            .get_subscriber_by_email(&identity.email)
            .await?
            .unwrap_or_else(|| SubscriberRecord::new(identity.email.clone()));
        Ok((profile, record))
    }

    /// Read, transform and compare-and-swap a profile's pause state
    ///
    /// A lost race reloads and applies `transition` again, so a double
    /// submission sees the first one's result.
    async fn update_pause<F>(
        &self,
        profile_id: &str,
        period_end: Option<DateTime<Utc>>,
        transition: F,
    ) -> Result<PauseState, EntitlementError>
    where
        F: Fn(&PauseState) -> Result<PauseState, EntitlementError>,
    {
        for attempt in 1..=PAUSE_WRITE_ATTEMPTS {
            let stored = self.store.get_pause_state(profile_id).await?;
            let current = match &stored {
                Some(stored) => stored.state.for_period(period_end),
                None => self.pauses.initial_state(period_end),
            };

            let next = transition(&current)?;
            if stored.as_ref().is_some_and(|s| s.state == next) {
                return Ok(next);
            }

            let expected = stored.as_ref().map(|s| s.revision);
            if self
                .store
                .replace_pause_state(profile_id, expected, &next)
                .await?
            {
                return Ok(next);
            }
            debug!(profile = profile_id, attempt = attempt, "Pause state changed concurrently, retrying");
        }

        Err(EntitlementError::PersistenceFailure(format!(
            "pause state for '{}' kept changing concurrently",
            profile_id
        )))
    }
}

/// Higher of the listing tier and the owner's unexpired subscriber tier
fn owning_tier_of(profile: &ProfileRecord, owner: &SubscriberRecord, now: DateTime<Utc>) -> Tier {
    profile.tier.max(owner.effective_tier(now))
}
