//! HTTP command surface
//!
//! Identity comes from the upstream auth gateway in `x-user-id` and
//! `x-user-email`. Errors are returned as `{error, message}` with a status
//! derived from the error kind.

mod billing;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use crate::billing::EntitlementService;
use crate::error::EntitlementError;

/// Build the router over a shared service
pub fn router(service: Arc<EntitlementService>) -> Router {
    Router::new()
        .route("/health", get(billing::health))
        .route("/reconcile", post(billing::reconcile))
        .route("/trial", post(billing::start_trial))
        .route("/profiles/:id/pause", post(billing::pause_profile))
        .route("/profiles/:id/resume", post(billing::resume_profile))
        .route("/profiles/:id/visibility", get(billing::profile_visibility))
        .with_state(service)
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn status_for(err: &EntitlementError) -> StatusCode {
    match err {
        EntitlementError::Unauthenticated => StatusCode::UNAUTHORIZED,
        EntitlementError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EntitlementError::AlreadyUsed
        | EntitlementError::QuotaExhausted { .. }
        | EntitlementError::NotPaused => StatusCode::CONFLICT,
        EntitlementError::NotEligible(_) => StatusCode::FORBIDDEN,
        EntitlementError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EntitlementError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for EntitlementError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if self.is_validation() {
            debug!(kind = self.kind(), status = status.as_u16(), "Request rejected: {}", self);
        } else {
            error!(kind = self.kind(), status = status.as_u16(), "Request failed: {}", self);
        }

        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
