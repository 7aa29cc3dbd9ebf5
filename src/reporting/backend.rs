//! Sentry-backed [`ReportSink`].

use crate::config::Environment;
use crate::error::{AppError, AppResult};

use super::{ErrorReport, ReportSink};

/// Reports errors to Sentry.
///
/// Holding the sink keeps the global client alive; dropping the last handle
/// flushes queued events.
pub struct SentrySink {
    _guard: sentry::ClientInitGuard,
}

impl SentrySink {
    /// Initialize the process-wide Sentry client.
    ///
    /// The default integrations are installed, including the panic hook that
    /// captures uncaught panics.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `access_token` is not a valid DSN or
    /// the client could not be enabled.
    pub fn init(access_token: &str, environment: Environment) -> AppResult<Self> {
        let dsn: sentry::types::Dsn = access_token
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid error reporter token: {e}")))?;

        let guard = sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            environment: Some(environment.as_str().into()),
            attach_stacktrace: true,
            ..Default::default()
        });

        if !guard.is_enabled() {
            return Err(AppError::ConfigError(
                "error reporting client could not be enabled".to_string(),
            ));
        }

        Ok(Self { _guard: guard })
    }
}

impl ReportSink for SentrySink {
    fn capture(&self, report: &ErrorReport) {
        sentry::with_scope(
            |scope| {
                if let Some(status) = report.status {
                    scope.set_tag("http.status_code", status.as_u16());
                }
                if let Some(method) = &report.method {
                    scope.set_tag("http.method", method);
                }
                if let Some(uri) = &report.uri {
                    scope.set_tag("url", uri);
                }
                scope.set_tag("uncaught", report.uncaught);
            },
            || {
                sentry::capture_message(&report.message, sentry::Level::Error);
            },
        );
    }
}
