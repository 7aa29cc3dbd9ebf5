//! Access logging with an environment-dependent line format.
//!
//! | Environment | Format       | Emitted                        |
//! |-------------|--------------|--------------------------------|
//! | development | [`Dev`]      | immediately, on request        |
//! | production  | [`Combined`] | after the response is produced |
//!
//! [`Dev`]: AccessLogFormat::Dev
//! [`Combined`]: AccessLogFormat::Combined
//!
//! Lines go through `tracing` on the `prod_shield::access` target, so the
//! subscriber decides where they end up.
//!
//! The layer is a `tower_http` [`TraceLayer`] with its own request and
//! response callbacks. The request half of each line is captured inside the
//! trace and carried to the response callback in the response extensions.

use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Version, header};
use chrono::{DateTime, Utc};
use tower::{Layer, Service};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnBodyChunk, DefaultOnEos, OnRequest, OnResponse, Trace, TraceLayer,
};
use tracing::{Span, info};

use super::ip::{TrustedProxyConfig, extract_client_ip_with_validation};
use crate::config::Environment;
use crate::metrics::record_request_duration;

/// Authenticated user name, inserted into request extensions by an upstream
/// authentication layer. Shown as `remote-user` in combined lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser(pub String);

/// Line format of the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLogFormat {
    /// `GET /path 200 1.234 ms - 512`, with a colored status
    Dev,
    /// Apache/NCSA combined log format
    Combined,
}

impl AccessLogFormat {
    pub fn for_environment(environment: Environment) -> Self {
        if environment.is_production() {
            AccessLogFormat::Combined
        } else {
            AccessLogFormat::Dev
        }
    }
}

/// Request half of an access log line, captured before the request is handed on.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub remote_addr: String,
    pub remote_user: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestLine {
    /// Capture the request half of a line. Forwarding headers only name the
    /// client when the peer is one of `trusted_proxies`.
    pub fn from_request<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Self {
        let headers = req.headers();
        Self {
            remote_addr: extract_client_ip_with_validation(req, trusted_proxies).into_owned(),
            remote_user: req.extensions().get::<RemoteUser>().map(|u| u.0.clone()),
            timestamp: Utc::now(),
            method: req.method().clone(),
            url: req
                .uri()
                .path_and_query()
                .map_or_else(|| req.uri().path().to_string(), |pq| pq.to_string()),
            version: req.version(),
            referrer: header_string(headers, header::REFERER),
            user_agent: header_string(headers, header::USER_AGENT),
        }
    }
}

/// Response half of an access log line.
#[derive(Debug, Clone, Copy)]
pub struct ResponseLine {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub elapsed: Duration,
}

impl ResponseLine {
    pub fn from_response<B>(res: &Response<B>, elapsed: Duration) -> Self {
        Self {
            status: res.status(),
            content_length: res
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            elapsed,
        }
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// Format an Apache combined log line.
///
/// Fields that are not known yet (for instance the status of an immediate
/// line) are written as `-`.
pub fn format_combined(req: &RequestLine, res: Option<&ResponseLine>) -> String {
    let status = res.map_or_else(|| "-".to_string(), |r| r.status.as_u16().to_string());
    let length = res
        .and_then(|r| r.content_length)
        .map_or_else(|| "-".to_string(), |l| l.to_string());

    format!(
        "{addr} - {user} [{ts}] \"{method} {url} {version:?}\" {status} {length} \"{referrer}\" \"{agent}\"",
        addr = req.remote_addr,
        user = or_dash(req.remote_user.as_deref()),
        ts = req.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
        method = req.method,
        url = req.url,
        version = req.version,
        referrer = or_dash(req.referrer.as_deref()),
        agent = or_dash(req.user_agent.as_deref()),
    )
}

/// Format a colored development line.
pub fn format_dev(req: &RequestLine, res: Option<&ResponseLine>) -> String {
    let mut line = format!("{} {}", req.method, req.url);

    match res {
        Some(res) => {
            let color = status_color(res.status);
            let _ = write!(
                line,
                " \x1b[{color}m{}\x1b[0m {:.3} ms - {}",
                res.status.as_u16(),
                res.elapsed.as_secs_f64() * 1000.0,
                res.content_length
                    .map_or_else(|| "-".to_string(), |l| l.to_string()),
            );
        }
        None => line.push_str(" - - ms - -"),
    }

    line
}

/// ANSI color code for a status: red, yellow, cyan, green, or none.
fn status_color(status: StatusCode) -> u8 {
    match status.as_u16() {
        500.. => 31,
        400..=499 => 33,
        300..=399 => 36,
        200..=299 => 32,
        _ => 0,
    }
}

/// Access logging layer for the Tower middleware stack.
#[derive(Debug, Clone)]
pub struct AccessLogLayer {
    logger: AccessLogger,
}

impl AccessLogLayer {
    /// Colored immediate logging in development, combined logging after the
    /// response in production.
    ///
    /// Client addresses are resolved against `trusted_proxies`, the same
    /// configuration the rate limiter keys on.
    pub fn for_environment(
        environment: Environment,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        Self {
            logger: AccessLogger {
                format: AccessLogFormat::for_environment(environment),
                immediate: !environment.is_production(),
                trusted_proxies,
            },
        }
    }

    pub fn format(&self) -> AccessLogFormat {
        self.logger.format
    }

    pub fn is_immediate(&self) -> bool {
        self.logger.immediate
    }
}

/// Service produced by [`AccessLogLayer`].
pub type AccessLogService<S> = Trace<
    CaptureRequestLine<S>,
    SharedClassifier<ServerErrorsAsFailures>,
    DefaultMakeSpan,
    AccessLogger,
    AccessLogger,
    DefaultOnBodyChunk,
    DefaultOnEos,
    (),
>;

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let capture = CaptureRequestLine {
            inner,
            trusted_proxies: self.logger.trusted_proxies.clone(),
        };

        TraceLayer::new_for_http()
            .on_request(self.logger.clone())
            .on_response(self.logger.clone())
            .on_failure(())
            .layer(capture)
    }
}

/// Request and response callbacks that write the access log.
#[derive(Debug, Clone)]
pub struct AccessLogger {
    format: AccessLogFormat,
    immediate: bool,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl AccessLogger {
    fn emit(&self, req: &RequestLine, res: Option<&ResponseLine>) {
        let line = match self.format {
            AccessLogFormat::Dev => format_dev(req, res),
            AccessLogFormat::Combined => format_combined(req, res),
        };
        info!(target: "prod_shield::access", "{line}");
    }
}

impl<B> OnRequest<B> for AccessLogger {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        if self.immediate {
            let line = RequestLine::from_request(request, &self.trusted_proxies);
            self.emit(&line, None);
        }
    }
}

impl<B> OnResponse<B> for AccessLogger {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        let Some(line) = response.extensions().get::<RequestLine>() else {
            return;
        };
        let res_line = ResponseLine::from_response(response, latency);

        record_request_duration(
            line.method.as_str(),
            res_line.status.as_str(),
            latency.as_secs_f64(),
        );

        if !self.immediate {
            self.emit(line, Some(&res_line));
        }
    }
}

/// Inner half of [`AccessLogService`]: records the [`RequestLine`] in the
/// extensions of the response it wraps.
#[derive(Debug, Clone)]
pub struct CaptureRequestLine<S> {
    inner: S,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CaptureRequestLine<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let line = RequestLine::from_request(&req, &self.trusted_proxies);
        let future = self.inner.call(req);

        Box::pin(async move {
            let mut response = future.await?;
            response.extensions_mut().insert(line);
            Ok(response)
        })
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::routing::get;
    use chrono::TimeZone;
    use tower::ServiceExt;

    use super::log_capture::LogCapture;
    use super::*;

    fn sample_line() -> RequestLine {
        RequestLine {
            remote_addr: "203.0.113.5".to_string(),
            remote_user: None,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap(),
            method: Method::GET,
            url: "/docs?page=2".to_string(),
            version: Version::HTTP_11,
            referrer: Some("https://example.com/".to_string()),
            user_agent: Some("curl/8.5.0".to_string()),
        }
    }

    fn ok_response() -> ResponseLine {
        ResponseLine {
            status: StatusCode::OK,
            content_length: Some(512),
            elapsed: Duration::from_micros(1500),
        }
    }

    #[test]
    fn test_format_for_environment() {
        assert_eq!(
            AccessLogFormat::for_environment(Environment::Development),
            AccessLogFormat::Dev
        );
        assert_eq!(
            AccessLogFormat::for_environment(Environment::Production),
            AccessLogFormat::Combined
        );

        assert!(
            AccessLogLayer::for_environment(Environment::Development, Arc::default())
                .is_immediate()
        );
        assert!(
            !AccessLogLayer::for_environment(Environment::Production, Arc::default())
                .is_immediate()
        );
    }

    #[test]
    fn test_format_combined() {
        let line = format_combined(&sample_line(), Some(&ok_response()));
        assert_eq!(
            line,
            "203.0.113.5 - - [07/Mar/2024:14:05:09 +0000] \"GET /docs?page=2 HTTP/1.1\" 200 512 \"https://example.com/\" \"curl/8.5.0\""
        );
    }

    #[test]
    fn test_format_combined_with_user_and_missing_fields() {
        let mut req = sample_line();
        req.remote_user = Some("alice".to_string());
        req.referrer = None;
        req.user_agent = None;

        let line = format_combined(&req, None);
        assert!(line.starts_with("203.0.113.5 - alice ["));
        assert!(line.ends_with("\" - - \"-\" \"-\""));
    }

    #[test]
    fn test_format_dev() {
        let line = format_dev(&sample_line(), Some(&ok_response()));
        assert_eq!(line, "GET /docs?page=2 \x1b[32m200\x1b[0m 1.500 ms - 512");

        let immediate = format_dev(&sample_line(), None);
        assert_eq!(immediate, "GET /docs?page=2 - - ms - -");
    }

    #[test]
    fn test_status_colors() {
        assert_eq!(status_color(StatusCode::INTERNAL_SERVER_ERROR), 31);
        assert_eq!(status_color(StatusCode::NOT_FOUND), 33);
        assert_eq!(status_color(StatusCode::MOVED_PERMANENTLY), 36);
        assert_eq!(status_color(StatusCode::NO_CONTENT), 32);
        assert_eq!(status_color(StatusCode::SWITCHING_PROTOCOLS), 0);
    }

    #[test]
    fn test_request_line_reads_headers_and_user() {
        let mut req = Request::builder()
            .uri("/a/b?c=d")
            .header("x-forwarded-for", "198.51.100.1")
            .header("referer", "https://ref.example/")
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(RemoteUser("bob".to_string()));

        let line = RequestLine::from_request(&req, &TrustedProxyConfig::default());
        assert_eq!(line.remote_addr, "198.51.100.1");
        assert_eq!(line.remote_user.as_deref(), Some("bob"));
        assert_eq!(line.url, "/a/b?c=d");
        assert_eq!(line.referrer.as_deref(), Some("https://ref.example/"));
        assert_eq!(line.user_agent.as_deref(), Some("test-agent"));
    }

    fn spoofed_request(peer: &str) -> Request<Body> {
        let mut req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        req
    }

    #[test]
    fn test_request_line_ignores_forwarding_from_untrusted_peer() {
        let req = spoofed_request("203.0.113.9:5000");

        let line = RequestLine::from_request(&req, &TrustedProxyConfig::default());
        assert_eq!(line.remote_addr, "203.0.113.9");

        let trusted = TrustedProxyConfig::new(&["203.0.113.0/24".to_string()]);
        let line = RequestLine::from_request(&req, &trusted);
        assert_eq!(line.remote_addr, "1.2.3.4");
    }

    fn app(environment: Environment) -> Router {
        Router::new()
            .route("/", get(|| async { "hello" }))
            .layer(AccessLogLayer::for_environment(environment, Arc::default()))
    }

    #[tokio::test]
    async fn test_layer_passes_response_through() {
        for environment in [Environment::Development, Environment::Production] {
            let response = app(environment)
                .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_production_logs_combined_line_with_peer_address() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let response = app(Environment::Production)
            .oneshot(spoofed_request("203.0.113.9:5000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let output = logs.contents();
        assert!(output.contains("prod_shield::access"), "{output}");
        assert!(output.contains("203.0.113.9 - - ["), "{output}");
        assert!(output.contains("\"GET / HTTP/1.1\" 200 "), "{output}");
        assert!(!output.contains("1.2.3.4"), "{output}");
    }

    #[tokio::test]
    async fn test_development_logs_before_response() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        app(Environment::Development)
            .oneshot(Request::builder().uri("/?q=1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let output = logs.contents();
        assert!(output.contains("GET /?q=1 - - ms - -"), "{output}");
        assert!(!output.contains("HTTP/1.1"), "{output}");
    }
}
