//! Fixed-window request limiter keyed by client address.
//!
//! Each client gets a counter and the instant its window opened. The
//! read-increment-compare sequence runs under the map's shard lock for that
//! key, so concurrent requests from one client are counted exactly.

use crate::errors::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Entries kept before idle windows are swept out.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Record one request from `client`; false once the window's quota is spent.
    pub fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> bool {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }

    fn sweep(&self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, w| now.duration_since(w.started) < window);
        debug!(remaining = self.windows.len(), "swept idle rate limit windows");
    }
}

/// Middleware rejecting clients over their quota with 429.
pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !limiter.check(&client) {
        debug!(%client, "rate limit exceeded");
        return AppError::too_many_requests("Rate limit exceeded. Please try again later.")
            .into_response();
    }

    next.run(request).await
}
