//! HTTP middleware for production hardening and observability.
//!
//! - **Security**: HTTPS/canonical-host redirects, HSTS and `nosniff` headers
//! - **Access Log**: Colored dev lines or Apache combined lines
//! - **Rate Limiting**: Per-client ceiling over a one-minute window
//! - **Client IP**: Forwarding-header extraction validated against trusted proxies
//!
//! # Architecture
//!
//! ```text
//! Request → Access Log → Security → Rate Limiter → Handler → Response
//!                           ↓              ↓
//!                   301 to https://host  503 Blocked
//! ```
//!
//! The rate limiter is only attached in production. See
//! [`crate::server::secure_app`] for the assembled stack.

pub mod access_log;
pub mod ip;
pub mod rate_limit;
pub mod security;

pub use access_log::{AccessLogFormat, AccessLogLayer, RemoteUser};
pub use ip::{
    CidrRange, TrustedProxyConfig, UNKNOWN_IP, extract_client_ip,
    extract_client_ip_with_validation,
};
pub use rate_limit::{BLOCKED_BODY, RATE_LIMIT_WINDOW, RateLimitError, RateLimitLayer};
pub use security::{SecurityPolicy, enforce_https};
