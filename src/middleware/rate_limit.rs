//! Per-client rate limiting over a one-minute window.
//!
//! # Quota
//!
//! A client may send `60 * max_requests_per_second` requests per
//! [`RATE_LIMIT_WINDOW`]. The quota is evaluated by the Governor crate (GCRA):
//! the full ceiling is available as a burst and is replenished evenly over one
//! window, so a client that bursts its whole allowance is blocked until cells
//! come back.
//!
//! # Rejections
//!
//! Requests over the ceiling are answered with `503 Service Unavailable` and
//! the plain-text body [`BLOCKED_BODY`]. No `X-RateLimit-*` or `Retry-After`
//! headers are exposed. Every rejection is logged as a combined log line on
//! the `prod_shield::rate_limit` target.
//!
//! # Memory
//!
//! Each client key holds a few bytes of state. [`RateLimitLayer::prune`]
//! forgets clients whose allowance has fully replenished;
//! [`RateLimitLayer::spawn_pruner`] runs it once per window in the background.
//!
//! The limiter only exists in production; see [`RateLimitLayer::for_environment`].

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::task::JoinHandle;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::access_log::{RequestLine, ResponseLine, format_combined};
use super::ip::{TrustedProxyConfig, extract_client_ip_with_validation};
use crate::config::Environment;
use crate::metrics::record_rate_limited;

/// Length of the rate-limit window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Body sent to blocked clients.
pub const BLOCKED_BODY: &str = "Blocked for too many requests";

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("max requests per second must be greater than 0")]
    ZeroRps,

    #[error("max requests per second of {0} overflows the per-window ceiling")]
    CeilingOverflow(u32),
}

type KeyedLimiter<C> = RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

/// Rate limiting layer for the Tower middleware stack.
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(5)?; // 300 requests per minute per client
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(layer);
/// ```
pub struct RateLimitLayer<C: Clock = DefaultClock> {
    limiter: Arc<KeyedLimiter<C>>,
    ceiling: NonZeroU32,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<C: Clock> Clone for RateLimitLayer<C> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            ceiling: self.ceiling,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

impl<C: Clock> std::fmt::Debug for RateLimitLayer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("ceiling", &self.ceiling)
            .field("trusted_proxies", &self.trusted_proxies)
            .finish_non_exhaustive()
    }
}

impl RateLimitLayer {
    /// Create a per-client limiter allowing `max_rps * 60` requests per minute.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` if `max_rps` is 0 or the ceiling overflows.
    pub fn new(max_rps: u32) -> Result<Self, RateLimitError> {
        Self::with_trusted_proxies(max_rps, Arc::default())
    }

    /// Create a per-client limiter that honors forwarding headers only from
    /// `trusted_proxies`.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimitLayer::new`].
    pub fn with_trusted_proxies(
        max_rps: u32,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Result<Self, RateLimitError> {
        Self::with_clock(max_rps, trusted_proxies, DefaultClock::default())
    }

    /// Build the limiter the given environment calls for.
    ///
    /// Returns `Ok(None)` outside production, where no limiting is applied.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimitLayer::new`], checked in production only.
    pub fn for_environment(
        environment: Environment,
        max_rps: u32,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Result<Option<Self>, RateLimitError> {
        if !environment.is_production() {
            return Ok(None);
        }
        Self::with_trusted_proxies(max_rps, trusted_proxies).map(Some)
    }

    /// Prune idle clients every `period` until the handle is aborted.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_pruner(&self, period: Duration) -> JoinHandle<()> {
        let layer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                layer.prune();
            }
        })
    }
}

impl<C: Clock> RateLimitLayer<C> {
    /// Create a limiter driven by a custom clock.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimitLayer::new`].
    pub fn with_clock(
        max_rps: u32,
        trusted_proxies: Arc<TrustedProxyConfig>,
        clock: C,
    ) -> Result<Self, RateLimitError> {
        let ceiling = window_ceiling(max_rps)?;

        // One cell every window/ceiling, with the whole ceiling as burst.
        let period = RATE_LIMIT_WINDOW / ceiling.get();
        let quota = Quota::with_period(period)
            .ok_or(RateLimitError::CeilingOverflow(max_rps))?
            .allow_burst(ceiling);

        let limiter = RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock);

        Ok(Self {
            limiter: Arc::new(limiter),
            ceiling,
            trusted_proxies,
        })
    }

    /// Requests allowed per client per window.
    pub fn ceiling(&self) -> u32 {
        self.ceiling.get()
    }

    /// Number of clients the limiter currently holds state for.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }

    /// Forget clients whose allowance has fully replenished.
    pub fn prune(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(
            before,
            after = self.limiter.len(),
            "Pruned idle rate limit clients"
        );
    }
}

/// `60 * max_rps`, the number of requests allowed per window.
fn window_ceiling(max_rps: u32) -> Result<NonZeroU32, RateLimitError> {
    if max_rps == 0 {
        return Err(RateLimitError::ZeroRps);
    }
    max_rps
        .checked_mul(RATE_LIMIT_WINDOW.as_secs() as u32)
        .and_then(NonZeroU32::new)
        .ok_or(RateLimitError::CeilingOverflow(max_rps))
}

impl<S, C: Clock> Layer<S> for RateLimitLayer<C> {
    type Service = RateLimitService<S, C>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

/// Rate limiting service wrapper.
pub struct RateLimitService<S, C: Clock = DefaultClock> {
    inner: S,
    limiter: Arc<KeyedLimiter<C>>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S: Clone, C: Clock> Clone for RateLimitService<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

impl<S, C> Service<Request<Body>> for RateLimitService<S, C>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    C: Clock,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let started = Instant::now();
        let client_ip = extract_client_ip_with_validation(&req, &self.trusted_proxies).into_owned();

        if self.limiter.check_key(&client_ip).is_ok() {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(req).await });
        }

        let response = blocked_response();

        let line = RequestLine::from_request(&req, &self.trusted_proxies);
        let res_line = ResponseLine::from_response(&response, started.elapsed());
        warn!(
            target: "prod_shield::rate_limit",
            client_ip = %client_ip,
            "{}",
            format_combined(&line, Some(&res_line))
        );
        record_rate_limited();

        Box::pin(async move { Ok(response) })
    }
}

fn blocked_response() -> Response<Body> {
    let mut response = Response::new(Body::from(BLOCKED_BODY));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(BLOCKED_BODY.len()));
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::extract::ConnectInfo;
    use axum::routing::get;
    use governor::clock::FakeRelativeClock;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn request_from(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn app_with_clock(max_rps: u32, clock: FakeRelativeClock) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RateLimitLayer::with_clock(max_rps, Arc::default(), clock).unwrap())
    }

    #[test]
    fn test_ceiling_is_sixty_times_rps() {
        assert_eq!(RateLimitLayer::new(5).unwrap().ceiling(), 300);
        assert_eq!(RateLimitLayer::new(1).unwrap().ceiling(), 60);
    }

    #[test]
    fn test_zero_rps_returns_error() {
        assert!(matches!(
            RateLimitLayer::new(0),
            Err(RateLimitError::ZeroRps)
        ));
    }

    #[test]
    fn test_ceiling_overflow_returns_error() {
        assert!(matches!(
            RateLimitLayer::new(u32::MAX),
            Err(RateLimitError::CeilingOverflow(_))
        ));
    }

    #[test]
    fn test_disabled_outside_production() {
        let layer =
            RateLimitLayer::for_environment(Environment::Development, 5, Arc::default()).unwrap();
        assert!(layer.is_none());

        let layer =
            RateLimitLayer::for_environment(Environment::Production, 5, Arc::default()).unwrap();
        assert_eq!(layer.unwrap().ceiling(), 300);
    }

    #[tokio::test]
    async fn test_301st_request_in_window_is_blocked() {
        let app = app_with_clock(5, FakeRelativeClock::default());

        for i in 1..=300 {
            let response = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {i} was blocked");
        }

        let response = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
        assert!(response.headers().get("x-ratelimit-remaining").is_none());
        assert!(response.headers().get("retry-after").is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], BLOCKED_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_clients_are_limited_independently() {
        let app = app_with_clock(1, FakeRelativeClock::default());

        for _ in 0..60 {
            app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        }
        let blocked = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::SERVICE_UNAVAILABLE);

        let other = app.clone().oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_allowance_returns_after_window() {
        let clock = FakeRelativeClock::default();
        let app = app_with_clock(1, clock.clone());

        for _ in 0..60 {
            app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        }
        let blocked = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::SERVICE_UNAVAILABLE);

        clock.advance(RATE_LIMIT_WINDOW);

        for i in 1..=60 {
            let response = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {i} was blocked");
        }
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_evade_limit() {
        let app = app_with_clock(5, FakeRelativeClock::default());
        let peer: SocketAddr = "203.0.113.1:4000".parse().unwrap();

        let mut last = StatusCode::OK;
        for i in 0..=300u32 {
            let mut req = request_from(&format!("10.1.{}.{}", i / 256, i % 256));
            req.extensions_mut().insert(ConnectInfo(peer));
            last = app.clone().oneshot(req).await.unwrap().status();
        }
        assert_eq!(last, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_prune_forgets_idle_clients() {
        let clock = FakeRelativeClock::default();
        let layer = RateLimitLayer::with_clock(1, Arc::default(), clock.clone()).unwrap();
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(layer.clone());

        for i in 0..50 {
            app.clone()
                .oneshot(request_from(&format!("10.0.0.{i}")))
                .await
                .unwrap();
        }
        assert_eq!(layer.tracked_clients(), 50);

        layer.prune();
        assert_eq!(layer.tracked_clients(), 50);

        clock.advance(RATE_LIMIT_WINDOW);
        layer.prune();
        assert_eq!(layer.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn test_pruner_runs_in_background() {
        let layer = RateLimitLayer::new(1).unwrap();
        let handle = layer.spawn_pruner(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
