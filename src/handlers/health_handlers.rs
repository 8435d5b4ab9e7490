//! Liveness and readiness probes.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, fmt::Display};

/// `GET /healthz`: answers without touching either store.
pub async fn healthz() -> impl IntoResponse {
    Json(Probe {
        status: "ok",
        checks: BTreeMap::new(),
    })
}

/// `GET /readyz`
///
/// Pings the metadata database and opens a blob store session. Returns 503
/// when either fails; the cause is only logged.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert(
        "metadata",
        Check::from_result("metadata store", state.metadata.ping().await),
    );
    checks.insert(
        "blob_store",
        Check::from_result("blob store", state.blobs.check().await),
    );

    let ready = checks.values().all(|c| c.ok);
    let (code, status) = if ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "error")
    };
    (code, Json(Probe { status, checks }))
}

#[derive(Serialize)]
struct Probe {
    status: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    checks: BTreeMap<&'static str, Check>,
}

#[derive(Serialize)]
struct Check {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Check {
    fn from_result<E: Display>(component: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "readiness: {} unavailable", component);
                Self {
                    ok: false,
                    error: Some(format!("{component} unavailable")),
                }
            }
        }
    }
}
