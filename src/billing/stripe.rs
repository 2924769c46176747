//! Stripe adapter for the payment-provider read contract
//!
//! Talks to Stripe's REST API directly with reqwest. Only list/search
//! endpoints are used; nothing here creates or changes provider objects.
//!
//! Transient failures (HTTP 429, 5xx, timeouts, connection errors) are
//! retried with exponential backoff before surfacing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::provider::{OneTimePayment, PaymentProvider, ProviderError, RecurringSubscription};

/// Metadata key carrying the purchased tier on one-time payments
const META_TIER: &str = "tier";
/// Metadata key carrying the entitlement length in days
const META_DURATION_DAYS: &str = "duration_days";
/// Upper bound for a single backoff sleep
const MAX_BACKOFF_MS: u64 = 5_000;
/// How many recent payment intents to inspect
const PAYMENT_PAGE_SIZE: &str = "25";

/// Stripe connection settings
#[derive(Clone)]
pub struct StripeConfig {
    pub api_base: String,
    pub secret_key: String,
    /// Per-request timeout
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

// Never print the key
impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .finish_non_exhaustive()
    }
}

/// Check the shape of a Stripe secret or restricted key
pub fn validate_api_key(key: &str) -> Result<(), ProviderError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.len() < MIN_KEY_LENGTH {
        return Err(ProviderError::InvalidConfig(format!(
            "API key too short (minimum {} characters)",
            MIN_KEY_LENGTH
        )));
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(ProviderError::InvalidConfig(
            "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        ));
    }

    Ok(())
}

/// Exponential backoff: base * 2^attempt, capped
fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    Duration::from_millis(delay_ms.min(max_ms))
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionItem {
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    status: String,
    /// Top-level on older API versions, per item on newer ones
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    items: Option<StripeList<StripeSubscriptionItem>>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    amount: i64,
    created: i64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Best-effort human message from a Stripe error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<StripeErrorBody>(body)
        .ok()
        .and_then(|b| b.error.message)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn subscriptions_from_list(list: StripeList<StripeSubscription>) -> Vec<RecurringSubscription> {
    list.data
        .into_iter()
        .filter(|s| s.status == "active")
        .filter_map(|s| {
            let period_end = s.current_period_end.or_else(|| {
                s.items
                    .as_ref()
                    .and_then(|items| items.data.iter().filter_map(|i| i.current_period_end).max())
            });
            match period_end.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)) {
                Some(period_end) => Some(RecurringSubscription {
                    id: s.id,
                    period_end,
                }),
                None => {
                    warn!(subscription = s.id.as_str(), "Active subscription without period end");
                    None
                }
            }
        })
        .collect()
}

fn payments_from_intents(list: StripeList<StripePaymentIntent>) -> Vec<OneTimePayment> {
    list.data
        .into_iter()
        .filter(|p| p.status == "succeeded")
        .filter_map(|p| {
            let tier_tag = p.metadata.get(META_TIER)?.clone();
            let duration_days = match p.metadata.get(META_DURATION_DAYS)?.trim().parse::<u32>() {
                Ok(days) => days,
                Err(_) => {
                    debug!(payment = p.id.as_str(), "Ignoring payment with bad duration metadata");
                    return None;
                }
            };
            let paid_at = DateTime::<Utc>::from_timestamp(p.created, 0)?;
            Some(OneTimePayment {
                id: p.id,
                paid_at,
                amount: p.amount,
                tier_tag,
                duration_days,
            })
        })
        .collect()
}

/// Stripe-backed payment provider
pub struct StripeProvider {
    client: Client,
    config: StripeConfig,
}

impl std::fmt::Debug for StripeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StripeProvider {
    /// Create a new Stripe provider
    pub fn new(config: StripeConfig) -> Result<Self, ProviderError> {
        validate_api_key(&config.secret_key)?;

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.get_once(operation, path, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(attempt, self.config.base_delay_ms, MAX_BACKOFF_MS);
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying payment provider call after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/v1/{}", self.config.api_base.trim_end_matches('/'), path);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        operation: operation.to_string(),
                    }
                } else {
                    ProviderError::Transport {
                        operation: operation.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        response.json::<T>().await.map_err(|e| ProviderError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<String>, ProviderError> {
        let list: StripeList<StripeCustomer> = self
            .get_json("customers", "customers", &[("email", email), ("limit", "1")])
            .await?;
        Ok(list.data.into_iter().next().map(|c| c.id))
    }

    async fn list_active_subscriptions(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<RecurringSubscription>, ProviderError> {
        let list: StripeList<StripeSubscription> = self
            .get_json(
                "subscriptions",
                "subscriptions",
                &[("customer", customer_ref), ("status", "active"), ("limit", "10")],
            )
            .await?;
        Ok(subscriptions_from_list(list))
    }

    async fn list_successful_one_time_payments(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<OneTimePayment>, ProviderError> {
        let list: StripeList<StripePaymentIntent> = self
            .get_json(
                "payment_intents",
                "payment_intents",
                &[("customer", customer_ref), ("limit", PAYMENT_PAGE_SIZE)],
            )
            .await?;
        Ok(payments_from_intents(list))
    }
}
