//! Error reporting bridge.
//!
//! # Flow
//!
//! ```text
//! handler ──AppError──▶ response + ErrorReport extension
//!                                │
//!                       ErrorHandlerLayer
//!                                │ check_ignore(uncaught, status)
//!                                ▼
//!                        ReportSink (Sentry in production)
//! ```
//!
//! Reporting only exists in production. [`ErrorReporter::init`] returns `None`
//! elsewhere, and [`error_handler`] turns a missing reporter into a
//! pass-through layer, so callers attach the handler unconditionally.
//!
//! Panics are the uncaught errors of this stack: the Sentry client installs a
//! panic hook that captures them whether they happen in a handler or in a
//! spawned task. [`check_ignore`] never suppresses them.

mod backend;

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, Uri};
use tower::{Layer, Service};
use tracing::{debug, info, warn};

pub use backend::SentrySink;

use crate::config::{Environment, require_environment};
use crate::error::AppResult;
use crate::metrics::{record_error_ignored, record_error_reported};

/// Statuses that are expected client errors and are not reported.
pub const IGNORED_STATUSES: [StatusCode; 5] = [
    StatusCode::BAD_REQUEST,
    StatusCode::FORBIDDEN,
    StatusCode::NOT_FOUND,
    StatusCode::PRECONDITION_FAILED,
    StatusCode::RANGE_NOT_SATISFIABLE,
];

/// Decide whether an error should be kept away from the reporting backend.
///
/// Uncaught errors are always reported. Handled errors are ignored when their
/// status is one of [`IGNORED_STATUSES`].
pub fn check_ignore(is_uncaught: bool, status: Option<StatusCode>) -> bool {
    !is_uncaught && status.is_some_and(|s| IGNORED_STATUSES.contains(&s))
}

/// An error on its way to the reporting backend.
///
/// Handlers put one into their response extensions; `AppError` does so for
/// every error it renders.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub status: Option<StatusCode>,
    pub message: String,
    pub uncaught: bool,
    pub method: Option<Method>,
    pub uri: Option<Uri>,
}

impl ErrorReport {
    /// A handled error rendered with `status`.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            uncaught: false,
            method: None,
            uri: None,
        }
    }

    /// An error nothing handled, such as a failed background task.
    pub fn uncaught(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            uncaught: true,
            method: None,
            uri: None,
        }
    }

    pub fn with_request(mut self, method: Method, uri: Uri) -> Self {
        self.method = Some(method);
        self.uri = Some(uri);
        self
    }

    /// Attach this report to a response for [`ErrorHandlerLayer`] to pick up.
    pub fn attach<B>(self, response: &mut Response<B>) {
        response.extensions_mut().insert(self);
    }
}

/// Destination of reported errors.
pub trait ReportSink: Send + Sync + 'static {
    fn capture(&self, report: &ErrorReport);
}

/// Options for [`ErrorReporter::init`].
#[derive(Debug, Clone, Default)]
pub struct ReporterOptions {
    /// Project DSN of the reporting backend
    pub access_token: Option<String>,
    pub environment: Option<Environment>,
}

/// Handle to the error-reporting client.
///
/// Cheap to clone; pass it to [`error_handler`] and to anything that wants to
/// report errors outside the request path.
#[derive(Clone)]
pub struct ErrorReporter {
    sink: Arc<dyn ReportSink>,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter").finish_non_exhaustive()
    }
}

impl ErrorReporter {
    /// Start the reporting client if the environment calls for one.
    ///
    /// Returns `Ok(None)` outside production, and in production when no
    /// access token is configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MissingEnvironment` if no environment was given, or
    /// `AppError::ConfigError` if the access token is not a valid DSN.
    pub fn init(options: &ReporterOptions) -> AppResult<Option<Self>> {
        let environment = require_environment(options.environment, "error reporter")?;

        if !environment.is_production() {
            info!(%environment, "Error reporting disabled outside production");
            return Ok(None);
        }

        let Some(token) = options.access_token.as_deref() else {
            warn!("No error reporter token configured, error reporting disabled");
            return Ok(None);
        };

        let sink = SentrySink::init(token, environment)?;
        info!("Error reporting enabled");
        Ok(Some(Self::with_sink(Arc::new(sink))))
    }

    /// Report through a custom backend.
    pub fn with_sink(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    /// Forward `report` unless [`check_ignore`] filters it.
    ///
    /// Returns whether the report was forwarded.
    pub fn report(&self, report: &ErrorReport) -> bool {
        let status = report.status.as_ref().map_or("none", StatusCode::as_str);

        if check_ignore(report.uncaught, report.status) {
            debug!(status, "Ignoring expected client error");
            record_error_ignored(status);
            return false;
        }

        self.sink.capture(report);
        record_error_reported(status);
        true
    }

    /// Report an error that escaped every handler.
    pub fn report_uncaught(&self, message: impl Into<String>) {
        self.report(&ErrorReport::uncaught(message));
    }
}

/// Layer that forwards the [`ErrorReport`] of each response to `reporter`.
///
/// Without a reporter the layer passes requests straight through.
///
/// ```rust,ignore
/// let reporter = ErrorReporter::init(&config.reporter_options())?;
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(error_handler(reporter.as_ref()));
/// ```
pub fn error_handler(reporter: Option<&ErrorReporter>) -> ErrorHandlerLayer {
    ErrorHandlerLayer {
        reporter: reporter.cloned(),
    }
}

#[derive(Debug, Clone)]
pub struct ErrorHandlerLayer {
    reporter: Option<ErrorReporter>,
}

impl ErrorHandlerLayer {
    pub fn is_enabled(&self) -> bool {
        self.reporter.is_some()
    }
}

impl<S> Layer<S> for ErrorHandlerLayer {
    type Service = ErrorHandlerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorHandlerService {
            inner,
            reporter: self.reporter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ErrorHandlerService<S> {
    inner: S,
    reporter: Option<ErrorReporter>,
}

impl<S> Service<Request<Body>> for ErrorHandlerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
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
        let mut inner = self.inner.clone();

        let Some(reporter) = self.reporter.clone() else {
            return Box::pin(async move { inner.call(req).await });
        };

        let method = req.method().clone();
        let uri = req.uri().clone();

        Box::pin(async move {
            let response = inner.call(req).await?;

            if let Some(report) = response.extensions().get::<ErrorReport>() {
                reporter.report(&report.clone().with_request(method, uri));
            }

            Ok(response)
        })
    }
}
