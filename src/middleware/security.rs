//! HTTPS enforcement and security headers.
//!
//! In production, `GET` requests that arrive over plain HTTP or under a
//! non-canonical hostname are answered with `301 Moved Permanently` to
//! `https://<canonical host><path>`. Every other request continues down the
//! stack and its response gets:
//!
//! - `Strict-Transport-Security: max-age=<secs>; includeSubDomains; preload`
//!   (`max-age=0` in development, one year in production)
//! - `X-Content-Type-Options: nosniff`
//!
//! The scheme is taken from `X-Forwarded-Proto` when a TLS-terminating proxy
//! sets it, the hostname from the `Host` header.

use axum::extract::{Request, State};
use axum::http::header::{HOST, LOCATION, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::config::Environment;
use crate::error::{AppError, AppResult};
use crate::metrics::record_https_redirect;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Canonical origin and header values for [`enforce_https`].
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    environment: Environment,
    canonical_host: String,
    hsts: HeaderValue,
}

impl SecurityPolicy {
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `canonical_host` is empty in production.
    pub fn new(environment: Environment, canonical_host: impl Into<String>) -> AppResult<Self> {
        let canonical_host = canonical_host.into().trim().to_ascii_lowercase();
        if environment.is_production() && canonical_host.is_empty() {
            return Err(AppError::ConfigError(
                "a canonical host is required in production".to_string(),
            ));
        }

        let max_age = environment.cache_lifetimes().hsts.as_secs();
        let hsts = HeaderValue::from_str(&format!(
            "max-age={max_age}; includeSubDomains; preload"
        ))
        .map_err(|e| AppError::ConfigError(format!("Invalid HSTS header: {e}")))?;

        Ok(Self {
            environment,
            canonical_host,
            hsts,
        })
    }

    pub fn hsts_header(&self) -> &HeaderValue {
        &self.hsts
    }

    /// Location to redirect to, or `None` if the request may proceed.
    pub fn redirect_target<B>(&self, req: &axum::http::Request<B>) -> Option<String> {
        if !self.environment.is_production() || req.method() != Method::GET {
            return None;
        }

        let secure = request_scheme(req).eq_ignore_ascii_case("https");
        let canonical = request_hostname(req)
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.canonical_host));

        if secure && canonical {
            return None;
        }

        let path = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        Some(format!("https://{}{}", self.canonical_host, path))
    }
}

/// Scheme the client used, as reported by the proxy or the request URI.
fn request_scheme<B>(req: &axum::http::Request<B>) -> &str {
    req.headers()
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| req.uri().scheme_str())
        .unwrap_or("http")
}

/// Hostname of the request without any port.
fn request_hostname<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .map(strip_port)
}

/// Strip a trailing `:port` from an authority, keeping IPv6 brackets intact.
pub fn strip_port(authority: &str) -> &str {
    let authority = authority.trim();
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => authority.get(..=end).unwrap_or(authority),
            None => authority,
        };
    }
    authority
        .split_once(':')
        .map_or(authority, |(host, _)| host)
}

/// Redirect to the canonical HTTPS origin or stamp the security headers.
///
/// ```rust,ignore
/// let policy = SecurityPolicy::new(Environment::Production, "example.com")?;
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(policy, enforce_https));
/// ```
pub async fn enforce_https(
    State(policy): State<SecurityPolicy>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(location) = policy.redirect_target(&request) {
        debug!(
            from = %request.uri(),
            to = %location,
            "Redirecting to canonical HTTPS origin"
        );
        record_https_redirect();
        return (StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)]).into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(STRICT_TRANSPORT_SECURITY, policy.hsts.clone());
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}
