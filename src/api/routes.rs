//! # API Routes
//!
//! Route table for the HTTP facade:
//!
//! - `/amt` - Analysis module type registration and lookup
//! - `/process_request` - Analysis request submission
//! - `/work_queue` - Worker polling
//! - `/analysis_tracking` - Root and details lookup
//! - `/storage` - Content-addressed blob storage
//! - `/config` - Configuration settings
//! - `/auth` - Api key management (admin)
//! - `/ams` - Alert system registration and long-polling

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::middleware::auth_middleware;
use crate::system::CoreSystem;

/// Create the complete router over a core system.
pub fn create_router(system: Arc<CoreSystem>) -> Router {
    Router::new()
        // module types
        .route("/amt", post(register_amt))
        .route("/amt/:name", get(get_amt))
        // request processing
        .route("/process_request", post(process_request))
        .route("/work_queue", post(get_next_work))
        // analysis tracking
        .route("/analysis_tracking/root/:uuid", get(get_root))
        .route("/analysis_tracking/details/:uuid", get(get_details))
        // blob storage
        .route("/storage", post(store_content))
        .route("/storage/meta/:sha256", get(get_content_meta))
        .route("/storage/:sha256", get(get_content))
        // configuration
        .route(
            "/config",
            put(put_config).get(get_config).delete(delete_config),
        )
        // api keys (admin checks inside the handlers)
        .route("/auth", post(create_api_key))
        .route("/auth/:name", delete(delete_api_key))
        // alert systems
        .route(
            "/ams/:name",
            put(register_alert_system)
                .delete(unregister_alert_system)
                .get(get_alerts),
        )
        // bearer-token authentication on every route
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(from_fn_with_state(Arc::clone(&system), auth_middleware)),
        )
        .with_state(system)
}
