//! Request handlers for the HTTP facade. Each handler is a thin delegate
//! into the core system.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::api::middleware::{admin_required, ApiKeyContext};
use crate::api::responses::{not_found, ApiError, ErrorEnvelope};
use crate::config::ConfigurationSetting;
use crate::constants::DEFAULT_CONTENT_BUFFER_SIZE;
use crate::models::content::ContentSpec;
use crate::models::{AnalysisModuleType, AnalysisRequest};
use crate::system::CoreSystem;

// ============================================================================
// Module types
// ============================================================================

/// POST /amt: register an analysis module type.
pub async fn register_amt(
    State(system): State<Arc<CoreSystem>>,
    Json(module_type): Json<AnalysisModuleType>,
) -> Result<Json<AnalysisModuleType>, ApiError> {
    let registered = system.register_analysis_module_type(module_type).await?;
    Ok(Json(registered))
}

/// GET /amt/:name: fetch a registered module type.
pub async fn get_amt(
    State(system): State<Arc<CoreSystem>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match system.get_analysis_module_type(&name).await? {
        Some(module_type) => Ok(Json(module_type).into_response()),
        None => Ok(not_found(
            "UNKNOWN_AMT",
            format!("unknown analysis module type: {}", name),
        )),
    }
}

// ============================================================================
// Request processing
// ============================================================================

/// POST /process_request: submit an analysis request.
pub async fn process_request(
    State(system): State<Arc<CoreSystem>>,
    Json(request): Json<AnalysisRequest>,
) -> Result<StatusCode, ApiError> {
    system.process_analysis_request(request).await?;
    Ok(StatusCode::OK)
}

/// Worker poll parameters.
#[derive(Debug, Deserialize, Serialize)]
pub struct WorkQueueQuery {
    /// Identifier of the polling worker.
    pub owner: String,

    /// Module type name to poll.
    pub amt: String,

    /// Worker's module version; must match the registration exactly.
    pub version: String,

    /// Worker's extended version claims.
    #[serde(default)]
    pub extended_version: Vec<String>,

    /// Seconds to block waiting for work. Zero polls without blocking.
    #[serde(default)]
    pub timeout: u64,
}

/// POST /work_queue: fetch the next analysis request for a module type.
pub async fn get_next_work(
    State(system): State<Arc<CoreSystem>>,
    Json(query): Json<WorkQueueQuery>,
) -> Result<Response, ApiError> {
    let result = system
        .get_next_analysis_request(
            &query.owner,
            &query.amt,
            Duration::from_secs(query.timeout),
            &query.version,
            &query.extended_version,
        )
        .await?;

    match result {
        Some(request) => Ok(Json(request).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ============================================================================
// Analysis tracking
// ============================================================================

/// GET /analysis_tracking/root/:uuid: fetch a root (details excluded).
pub async fn get_root(
    State(system): State<Arc<CoreSystem>>,
    Path(uuid): Path<Uuid>,
) -> Result<Response, ApiError> {
    match system.get_root_analysis(uuid).await? {
        Some(root) => Ok(Json(root).into_response()),
        None => Ok(not_found(
            "UNKNOWN_ROOT",
            format!("unknown root analysis: {}", uuid),
        )),
    }
}

/// GET /analysis_tracking/details/:uuid: fetch analysis details.
pub async fn get_details(
    State(system): State<Arc<CoreSystem>>,
    Path(uuid): Path<Uuid>,
) -> Result<Response, ApiError> {
    match system.get_analysis_details(uuid).await? {
        Some(details) => Ok(Json(details).into_response()),
        None => Ok(not_found(
            "UNKNOWN_ROOT",
            format!("no analysis details for: {}", uuid),
        )),
    }
}

// ============================================================================
// Blob storage
// ============================================================================

/// POST /storage (multipart): store a blob.
pub async fn store_content(
    State(system): State<Arc<CoreSystem>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut data: Option<Vec<u8>> = None;
    let mut spec = ContentSpec::default();

    while let Ok(Some(field)) = multipart.next_field().await {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                if spec.name.is_empty() {
                    if let Some(file_name) = field.file_name() {
                        spec.name = file_name.to_string();
                    }
                }
                match field.bytes().await {
                    Ok(bytes) => data = Some(bytes.to_vec()),
                    Err(error) => {
                        return Ok(bad_request("INVALID_UPLOAD", error.to_string()));
                    }
                }
            }
            Some("name") => {
                if let Ok(value) = field.text().await {
                    spec.name = value;
                }
            }
            Some("expiration_date") => {
                if let Ok(value) = field.text().await {
                    match value.parse::<DateTime<Utc>>() {
                        Ok(parsed) => spec.expiration_date = Some(parsed),
                        Err(error) => {
                            return Ok(bad_request("INVALID_UPLOAD", error.to_string()));
                        }
                    }
                }
            }
            Some("custom") => {
                if let Ok(value) = field.text().await {
                    match serde_json::from_str(&value) {
                        Ok(parsed) => spec.custom = Some(parsed),
                        Err(error) => {
                            return Ok(bad_request("INVALID_UPLOAD", error.to_string()));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let data = match data {
        Some(data) => data,
        None => return Ok(bad_request("INVALID_UPLOAD", "missing file field")),
    };

    let meta = system.store_content(&data, spec).await?;
    Ok(Json(meta).into_response())
}

/// GET /storage/:sha256: stream blob bytes.
pub async fn get_content(
    State(system): State<Arc<CoreSystem>>,
    Path(sha256): Path<String>,
) -> Result<Response, ApiError> {
    let chunks = match system
        .iter_content(&sha256, DEFAULT_CONTENT_BUFFER_SIZE)
        .await?
    {
        Some(chunks) => chunks,
        None => {
            return Ok(not_found(
                "UNKNOWN_CONTENT",
                format!("unknown content: {}", sha256),
            ))
        }
    };

    let stream = futures::stream::unfold(chunks, |mut chunks| async move {
        match chunks.next_chunk().await {
            Ok(Some(data)) => Some((Ok::<_, std::io::Error>(data), chunks)),
            Ok(None) => None,
            Err(error) => {
                log::warn!("content stream failed: {}", error);
                None
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// GET /storage/meta/:sha256: fetch blob metadata.
pub async fn get_content_meta(
    State(system): State<Arc<CoreSystem>>,
    Path(sha256): Path<String>,
) -> Result<Response, ApiError> {
    match system.get_content_meta(&sha256).await? {
        Some(meta) => Ok(Json(meta).into_response()),
        None => Ok(not_found(
            "UNKNOWN_CONTENT",
            format!("unknown content: {}", sha256),
        )),
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Key selector for config reads and deletes.
#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    /// Dotted path key.
    pub key: String,
}

/// GET /config?key=: fetch a configuration setting.
pub async fn get_config(
    State(system): State<Arc<CoreSystem>>,
    Query(query): Query<ConfigQuery>,
) -> Result<Response, ApiError> {
    match system.get_config(&query.key).await? {
        Some(setting) => Ok(Json(setting).into_response()),
        None => Ok(not_found(
            "UNKNOWN_CONFIG",
            format!("unknown configuration key: {}", query.key),
        )),
    }
}

/// PUT /config: store a configuration setting.
pub async fn put_config(
    State(system): State<Arc<CoreSystem>>,
    Json(setting): Json<ConfigurationSetting>,
) -> Result<StatusCode, ApiError> {
    system
        .set_config(&setting.key, setting.value, setting.documentation)
        .await?;
    Ok(StatusCode::CREATED)
}

/// DELETE /config?key=: delete a configuration setting.
pub async fn delete_config(
    State(system): State<Arc<CoreSystem>>,
    Query(query): Query<ConfigQuery>,
) -> Result<Response, ApiError> {
    if system.delete_config(&query.key).await? {
        Ok(StatusCode::OK.into_response())
    } else {
        Ok(not_found(
            "UNKNOWN_CONFIG",
            format!("unknown configuration key: {}", query.key),
        ))
    }
}

// ============================================================================
// Authentication (admin)
// ============================================================================

/// Api key creation request.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateApiKeyRequest {
    /// Unique key name.
    pub name: String,

    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,

    /// Whether the key grants admin endpoints.
    #[serde(default)]
    pub is_admin: bool,
}

/// Api key creation response; the only time the clear value is visible.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateApiKeyResponse {
    /// The clear api key value.
    pub api_key: String,
}

/// POST /auth: create an api key (admin).
pub async fn create_api_key(
    State(system): State<Arc<CoreSystem>>,
    Extension(context): Extension<ApiKeyContext>,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<Response, ApiError> {
    if !system.verify_api_key(&context.api_key, true).await? {
        return Ok(admin_required());
    }

    let api_key = system
        .create_api_key(&request.name, request.description, request.is_admin)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateApiKeyResponse { api_key })).into_response())
}

/// DELETE /auth/:name: delete an api key (admin).
pub async fn delete_api_key(
    State(system): State<Arc<CoreSystem>>,
    Extension(context): Extension<ApiKeyContext>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !system.verify_api_key(&context.api_key, true).await? {
        return Ok(admin_required());
    }

    if system.delete_api_key(&name).await? {
        Ok(StatusCode::OK.into_response())
    } else {
        Ok(not_found(
            "UNKNOWN_API_KEY",
            format!("unknown api key: {}", name),
        ))
    }
}

// ============================================================================
// Alert systems
// ============================================================================

/// Long-poll parameters for alert fetching.
#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    /// Seconds to block waiting for an alert.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// PUT /ams/:name: register an alert system.
pub async fn register_alert_system(
    State(system): State<Arc<CoreSystem>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if system.register_alert_system(&name).await? {
        Ok(StatusCode::CREATED)
    } else {
        Ok(StatusCode::OK)
    }
}

/// DELETE /ams/:name: unregister an alert system.
pub async fn unregister_alert_system(
    State(system): State<Arc<CoreSystem>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if system.unregister_alert_system(&name).await? {
        Ok(StatusCode::OK.into_response())
    } else {
        Ok(not_found(
            "UNKNOWN_ALERT_SYSTEM",
            format!("unknown alert system: {}", name),
        ))
    }
}

/// GET /ams/:name?timeout=: fetch (optionally long-polling) alerts.
pub async fn get_alerts(
    State(system): State<Arc<CoreSystem>>,
    Path(name): Path<String>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Vec<Uuid>>, ApiError> {
    let timeout = query.timeout.map(Duration::from_secs);
    let alerts = system.get_alerts(&name, timeout).await?;
    Ok(Json(alerts))
}

fn bad_request(code: &str, details: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorEnvelope::new(code, details)),
    )
        .into_response()
}
