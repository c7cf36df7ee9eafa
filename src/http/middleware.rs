//! Axum middleware wrapping admin routes with the gate.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use tracing::debug;

use super::response::stamp_headers;
use crate::ratelimit::{Decision, Denial, Gate, UsageSnapshot};

/// Header carrying the caller's API key identifier.
pub const API_KEY_ID_HEADER: &str = "x-api-key-id";

/// Authenticated API key of the current request.
///
/// Placed in request extensions by whatever authenticates the caller; the
/// gate middleware only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyId(pub String);

/// Resolve [`ApiKeyId`] from the `x-api-key-id` header.
///
/// Meant for deployments where an upstream proxy has already authenticated
/// the key.
pub async fn resolve_api_key_header(mut request: Request, next: Next) -> Response {
    let key = request
        .headers()
        .get(API_KEY_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| ApiKeyId(value.to_string()));

    if let Some(key) = key {
        request.extensions_mut().insert(key);
    }
    next.run(request).await
}

/// Gate every request through [`Gate::check`].
///
/// Admitted requests reach the handler and get `RateLimit-*` headers on the
/// way out; refused ones never reach the handler.
///
/// ```rust,ignore
/// let admin = Router::new()
///     .route("/users", get(list_users))
///     .layer(middleware::from_fn_with_state(gate, admin_rate_limit));
/// ```
pub async fn admin_rate_limit(
    State(gate): State<Arc<Gate>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ApiKeyId(subject_id)) = request.extensions().get::<ApiKeyId>().cloned() else {
        debug!(path = %request.uri().path(), "Admin request without an API key");
        return Denial::SubjectMissing.into_response();
    };

    match gate.check(&subject_id, Utc::now()).await {
        Decision::Allowed(admission) => {
            let mut response = next.run(request).await;
            stamp_headers(response.headers_mut(), &admission);
            response
        }
        Decision::Denied(denial) => denial.into_response(),
    }
}

/// Report the caller's current usage without consuming budget.
pub async fn rate_limit_status(
    State(gate): State<Arc<Gate>>,
    key: Option<Extension<ApiKeyId>>,
) -> Result<Json<UsageSnapshot>, Denial> {
    let Some(Extension(ApiKeyId(subject_id))) = key else {
        return Err(Denial::SubjectMissing);
    };

    let snapshot = gate.status(&subject_id, Utc::now()).await?;
    Ok(Json(snapshot))
}
