//! Bearer-token authentication middleware.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::api::responses::ErrorEnvelope;
use crate::system::CoreSystem;

/// The verified api key for the current request, stored in request
/// extensions so handlers can perform the admin re-check.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    /// Clear api key supplied by the caller.
    pub api_key: String,
}

fn unauthorized(details: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorEnvelope::new("UNAUTHORIZED", details)),
    )
        .into_response()
}

/// Require a valid `Authorization: Bearer <api_key>` header on every
/// request. The verified key is stored for handlers that need the admin
/// check.
pub async fn auth_middleware(
    State(system): State<Arc<CoreSystem>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let token = match token {
        Some(token) => token,
        None => return unauthorized("missing bearer token"),
    };

    match system.verify_api_key(&token, false).await {
        Ok(true) => {
            request
                .extensions_mut()
                .insert(ApiKeyContext { api_key: token });
            next.run(request).await
        }
        Ok(false) => unauthorized("invalid api key"),
        Err(error) => {
            log::error!("api key verification failed: {}", error);
            unauthorized("verification failed")
        }
    }
}

/// 403 response for non-admin callers on admin endpoints.
pub fn admin_required() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorEnvelope::new("ADMIN_REQUIRED", "admin api key required")),
    )
        .into_response()
}
