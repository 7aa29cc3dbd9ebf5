//! Assemble the production middleware stack around an application router.
//!
//! ```text
//! Request → Access Log → Security → Rate Limiter (prod) → app
//! ```
//!
//! [`secure_app`] attaches the layers but does not bind anything. The caller
//! starts the returned [`PreparedServer`] when it is ready.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::info;

use crate::config::{DEFAULT_MAX_REQUESTS_PER_SECOND, Environment, require_environment};
use crate::error::{AppError, AppResult};
use crate::middleware::{
    AccessLogLayer, RATE_LIMIT_WINDOW, RateLimitLayer, SecurityPolicy, TrustedProxyConfig,
    enforce_https,
};
use crate::utils::shutdown_signal;

/// Options for [`secure_app`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub environment: Option<Environment>,
    /// Canonical hostname production requests are redirected to
    pub host: String,
    pub max_requests_per_second: u32,
    /// CIDR ranges whose forwarding headers are trusted
    pub trusted_proxies: Vec<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            environment: None,
            host: String::new(),
            max_requests_per_second: DEFAULT_MAX_REQUESTS_PER_SECOND,
            trusted_proxies: Vec::new(),
        }
    }
}

/// Wrap `app` in the security, access log and rate limiting layers.
///
/// # Errors
///
/// Returns `AppError::MissingEnvironment` if no environment was given, before
/// any layer is attached. Returns `AppError::ConfigError` for an empty
/// canonical host in production and `AppError::RateLimit` for an unusable rate.
pub fn secure_app(app: Router, options: &ServerOptions) -> AppResult<PreparedServer> {
    let environment = require_environment(options.environment, "server")?;

    let policy = SecurityPolicy::new(environment, options.host.as_str())?;
    let trusted_proxies = Arc::new(TrustedProxyConfig::new(&options.trusted_proxies));
    let rate_limit = RateLimitLayer::for_environment(
        environment,
        options.max_requests_per_second,
        trusted_proxies.clone(),
    )?;

    let mut router = app;
    if let Some(layer) = &rate_limit {
        info!(
            ceiling = layer.ceiling(),
            window_secs = RATE_LIMIT_WINDOW.as_secs(),
            trusted_proxies = options.trusted_proxies.len(),
            "Rate limiting enabled"
        );
        router = router.layer(layer.clone());
    }

    // Outermost last, so redirects and rejections are logged too.
    let router = router
        .layer(axum::middleware::from_fn_with_state(policy, enforce_https))
        .layer(AccessLogLayer::for_environment(environment, trusted_proxies));

    Ok(PreparedServer {
        router,
        environment,
        rate_limit,
    })
}

/// A hardened router that has not been bound to a socket yet.
#[derive(Debug)]
pub struct PreparedServer {
    router: Router,
    environment: Environment,
    rate_limit: Option<RateLimitLayer>,
}

impl PreparedServer {
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The layered router, for embedding or in-process testing.
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Bind `addr` and serve until Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if binding or serving fails.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> AppResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to bind: {e}")))?;

        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve on an existing listener until `signal` resolves.
    ///
    /// Idle rate limit state is pruned once per window while serving.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the server fails.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| AppError::Internal(format!("Failed to read local address: {e}")))?;
        info!(%addr, environment = %self.environment, "Server listening");

        let pruner = self
            .rate_limit
            .as_ref()
            .map(|layer| layer.spawn_pruner(RATE_LIMIT_WINDOW));

        let served = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        if let Some(pruner) = pruner {
            pruner.abort();
        }
        served.map_err(|e| AppError::Internal(format!("Server error: {e}")))?;

        info!("Server shutdown complete");
        Ok(())
    }
}
