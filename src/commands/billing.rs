//! Handlers for entitlement, trial and pause commands

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::billing::{
    EntitlementService, EntitlementSnapshot, Identity, PauseState, ProfileVisibility, TrialGrant,
};
use crate::error::EntitlementError;

const USER_ID_HEADER: &str = "x-user-id";
const USER_EMAIL_HEADER: &str = "x-user-email";

type Service = State<Arc<EntitlementService>>;

/// Caller identity set by the auth gateway, if both headers are present
fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    Identity::new(header(USER_ID_HEADER)?, header(USER_EMAIL_HEADER)?)
}

#[derive(Debug, Deserialize)]
pub struct TrialRequest {
    role: String,
}

pub async fn health() -> &'static str {
    "ok"
}

/// Reconcile the caller's entitlement against the payment provider
pub async fn reconcile(
    State(service): Service,
    headers: HeaderMap,
) -> Result<Json<EntitlementSnapshot>, EntitlementError> {
    let identity = identity_from_headers(&headers);
    service.reconcile(identity.as_ref(), Utc::now()).await.map(Json)
}

/// Start the caller's one-time trial
pub async fn start_trial(
    State(service): Service,
    headers: HeaderMap,
    body: Result<Json<TrialRequest>, JsonRejection>,
) -> Result<Json<TrialGrant>, EntitlementError> {
    let identity = identity_from_headers(&headers).ok_or(EntitlementError::Unauthenticated)?;
    let Json(request) = body.map_err(|rejection| EntitlementError::InvalidRequest(rejection.body_text()))?;

    service
        .start_trial(Some(&identity), &request.role, Utc::now())
        .await
        .map(Json)
}

pub async fn pause_profile(
    State(service): Service,
    Path(profile_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PauseState>, EntitlementError> {
    let identity = identity_from_headers(&headers);
    service
        .pause_profile(identity.as_ref(), &profile_id, Utc::now())
        .await
        .map(Json)
}

pub async fn resume_profile(
    State(service): Service,
    Path(profile_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PauseState>, EntitlementError> {
    let identity = identity_from_headers(&headers);
    service
        .resume_profile(identity.as_ref(), &profile_id, Utc::now())
        .await
        .map(Json)
}

/// Public listing state; no identity required
pub async fn profile_visibility(
    State(service): Service,
    Path(profile_id): Path<String>,
) -> Result<Json<ProfileVisibility>, EntitlementError> {
    service
        .profile_visibility(&profile_id, Utc::now())
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::testing::FakeProvider;
    use crate::billing::{
        PaymentStatus, ProfileRecord, Role, ServiceSettings, SqliteStore, Tier,
    };
    use crate::commands::router;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = EntitlementService::new(
            store.clone(),
            Arc::new(FakeProvider::default()),
            ServiceSettings::default(),
        );
        (router(Arc::new(service)), store)
    }

    fn seed_profile(store: &SqliteStore, tier: Tier) {
        store
            .save_profile(&ProfileRecord {
                id: "p1".to_string(),
                owner_id: "u1".to_string(),
                role: Role::Escort,
                tier,
                is_active: true,
                payment_status: PaymentStatus::Paid,
            })
            .unwrap();
    }

    fn request(method: &str, uri: &str, body: Option<&str>, signed_in: bool) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if signed_in {
            builder = builder
                .header(USER_ID_HEADER, "u1")
                .header(USER_EMAIL_HEADER, "Ana@Example.com");
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[test]
    fn test_identity_needs_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "u1".parse().unwrap());
        assert!(identity_from_headers(&headers).is_none());

        headers.insert(USER_EMAIL_HEADER, " Ana@Example.com ".parse().unwrap());
        let identity = identity_from_headers(&headers).unwrap();
        assert_eq!(identity.email, "ana@example.com");
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(request("GET", "/health", None, false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_reconcile_unauthenticated() {
        let (app, _) = app();
        let (status, body) = send(&app, request("POST", "/reconcile", None, false)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_reconcile_returns_snapshot() {
        let (app, _) = app();
        let (status, body) = send(&app, request("POST", "/reconcile", None, true)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribed"], false);
        assert_eq!(body["tier"], "basic");
        assert_eq!(body["subscriptionType"], "free");
        assert_eq!(body["featured"], false);
        assert_eq!(body["verificationEligible"], false);
    }

    #[tokio::test]
    async fn test_trial_endpoint() {
        let (app, _) = app();

        let (status, body) = send(&app, request("POST", "/trial", Some("{not json"), true)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _) = send(&app, request("POST", "/trial", Some(r#"{"role":"client"}"#), true)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, request("POST", "/trial", Some(r#"{"role":"escort"}"#), false)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, request("POST", "/trial", Some(r#"{"role":"escort"}"#), true)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["trialEnd"].is_string());

        let (status, body) = send(&app, request("POST", "/trial", Some(r#"{"role":"escort"}"#), true)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_used");
    }

    #[tokio::test]
    async fn test_pause_and_resume_endpoints() {
        let (app, store) = app();
        seed_profile(&store, Tier::Tier4);

        let (status, body) = send(&app, request("POST", "/profiles/p1/pause", None, true)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["state"], "paused");
        assert_eq!(body["pausesUsedInPeriod"], 1);

        let (status, body) = send(&app, request("GET", "/profiles/p1/visibility", None, false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["visible"], false);
        assert_eq!(body["billable"], true);

        let (status, body) = send(&app, request("POST", "/profiles/p1/resume", None, true)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["state"], "active");

        let (status, body) = send(&app, request("POST", "/profiles/p1/resume", None, true)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_paused");
    }

    #[tokio::test]
    async fn test_pause_errors_map_to_statuses() {
        let (app, store) = app();
        seed_profile(&store, Tier::Tier1);

        let (status, body) = send(&app, request("POST", "/profiles/p1/pause", None, true)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "not_eligible");

        let (status, _) = send(&app, request("POST", "/profiles/missing/pause", None, true)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, request("POST", "/profiles/p1/pause", None, false)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_status_mapping() {
        use crate::commands::status_for;
        assert_eq!(
            status_for(&EntitlementError::NotEligible("tier".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&EntitlementError::QuotaExhausted { used: 3, cap: 3 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EntitlementError::ProviderUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&EntitlementError::PersistenceFailure("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
