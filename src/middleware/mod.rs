//! Request gating: per-client rate limiting and operator authentication.

pub mod admin_auth;
pub mod rate_limit;
