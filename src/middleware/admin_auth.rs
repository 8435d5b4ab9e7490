//! Operator authentication for destructive endpoints.
//!
//! Credential checking sits behind [`CredentialCheck`] so the static token can
//! be swapped for a stronger scheme without touching the handlers.

use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

pub trait CredentialCheck: Send + Sync {
    /// Whether the presented `Authorization` header value grants access.
    fn verify(&self, presented: Option<&str>) -> bool;
}

/// Shared static token, compared in constant time. With no token configured
/// every request is refused.
pub struct StaticTokenCheck {
    token: Option<String>,
}

impl StaticTokenCheck {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

impl CredentialCheck for StaticTokenCheck {
    fn verify(&self, presented: Option<&str>) -> bool {
        let (Some(expected), Some(presented)) = (self.token.as_deref(), presented) else {
            return false;
        };
        let presented = presented
            .strip_prefix("Bearer ")
            .unwrap_or(presented)
            .trim();
        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

pub type SharedCredentialCheck = Arc<dyn CredentialCheck>;

/// Middleware rejecting requests without a valid operator credential.
pub async fn require_admin(
    State(check): State<SharedCredentialCheck>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if !check.verify(presented) {
        warn!(uri = %request.uri(), "rejected unauthenticated admin request");
        return AppError::unauthorized("Authentication required").into_response();
    }

    next.run(request).await
}
