//! Defines routes for the file-sharing API.
//!
//! ## Structure
//! - `POST   /upload`          : multipart upload, returns a short code
//! - `GET    /download/{code}` : stream a file by code
//! - `DELETE /cleanup`         : operator-triggered expiry pass (admin token)
//! - `GET    /healthz`, `/readyz`
//!
//! Every route passes through the per-client rate limiter.

use crate::{
    handlers::{
        file_handlers::{cleanup_files, download_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    middleware::{
        admin_auth::{SharedCredentialCheck, require_admin},
        rate_limit::{RateLimiter, rate_limit},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, Method, header},
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Request gating and size limits applied around the routes.
pub struct RouteOptions {
    pub credentials: SharedCredentialCheck,
    pub limiter: RateLimiter,
    pub max_upload_bytes: usize,
}

/// Build the application router with its state attached.
pub fn routes(state: AppState, options: RouteOptions) -> Router {
    let admin = Router::new()
        .route("/cleanup", delete(cleanup_files))
        .route_layer(from_fn_with_state(options.credentials, require_admin));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(options.max_upload_bytes)),
        )
        .route("/download/{code}", get(download_file))
        .merge(admin)
        .layer(from_fn_with_state(options.limiter, rate_limit))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::very_permissive()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            HeaderName::from_static("origin"),
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ])
        .expose_headers([header::CONTENT_LENGTH])
        .max_age(Duration::from_secs(12 * 60 * 60))
}
