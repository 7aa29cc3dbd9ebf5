//! Deployment environment and application configuration.
//!
//! # Environment Flag
//!
//! Every component that behaves differently in production takes an explicit
//! [`Environment`]. Option structs carry it as `Option<Environment>` and
//! [`require_environment`] turns a missing value into
//! [`AppError::MissingEnvironment`] before anything is attached to a router.
//!
//! # Environment Variables
//!
//! - `APP_ENV`: `production` or `development` (**required**)
//! - `HOST` / `PORT`: Bind address (default: `0.0.0.0:3000`)
//! - `CANONICAL_HOST`: Hostname production traffic is redirected to
//! - `MAX_REQUESTS_PER_SECOND`: Rate limiter sustained rate (default: 5)
//! - `TRUSTED_PROXIES`: Comma-separated CIDR ranges of reverse proxies
//! - `ERROR_REPORTER_TOKEN`: Error-reporting project DSN (optional)
//! - `STATIC_DIR` / `STATIC_MOUNT`: Static asset directory and URL prefix
//! - `METRICS_PORT`: Prometheus listener port (default: 0 = disabled)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::reporting::ReporterOptions;
use crate::server::ServerOptions;
use crate::static_files::StaticOptions;

/// One year, the production lifetime for HSTS and cached static assets.
pub const ONE_YEAR: Duration = Duration::from_secs(31_536_000);

/// Default sustained request rate per client.
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 5;

/// Deployment environment, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    /// Cache lifetimes derived from this environment.
    pub fn cache_lifetimes(self) -> CacheLifetimes {
        let lifetime = if self.is_production() {
            ONE_YEAR
        } else {
            Duration::ZERO
        };
        CacheLifetimes {
            hsts: lifetime,
            static_assets: lifetime,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(AppError::ConfigError(format!(
                "Invalid APP_ENV: expected 'production' or 'development', got '{other}'"
            ))),
        }
    }
}

/// Cache lifetimes that scale with the deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLifetimes {
    /// `max-age` of the `Strict-Transport-Security` header
    pub hsts: Duration,
    /// `max-age` of cached static assets
    pub static_assets: Duration,
}

/// Fail fast when an entry point was called without an environment flag.
///
/// # Errors
///
/// Returns `AppError::MissingEnvironment` naming `entry_point` if `environment` is `None`.
pub fn require_environment(
    environment: Option<Environment>,
    entry_point: &'static str,
) -> AppResult<Environment> {
    environment.ok_or(AppError::MissingEnvironment(entry_point))
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Deployment environment (`APP_ENV`, required)
    pub environment: Environment,

    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Canonical hostname production requests are redirected to.
    /// Required when running in production.
    pub canonical_host: String,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Sustained requests per second per client (default: 5).
    /// The limiter allows `60 * max_requests_per_second` per minute.
    pub max_requests_per_second: u32,

    /// Trusted proxy CIDR ranges. When set, forwarding headers are only
    /// honored for connections from these networks.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Error Reporting Configuration
    // =========================================================================
    /// Error-reporting project DSN. Reporting stays off when unset.
    pub error_reporter_token: Option<String>,

    // =========================================================================
    // Static Assets Configuration
    // =========================================================================
    /// Directory served as static assets (default: "public")
    pub static_dir: String,

    /// URL prefix static assets are mounted at (default: "/static")
    pub static_mount: String,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `APP_ENV` is missing or any value is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment: Environment = lookup("APP_ENV")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                AppError::ConfigError(
                    "APP_ENV must be set to 'production' or 'development'".to_string(),
                )
            })?
            .parse()?;

        let config = Self {
            environment,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var(&lookup, "PORT", 3000)?,
            canonical_host: lookup("CANONICAL_HOST")
                .map(|h| h.trim().to_string())
                .unwrap_or_default(),

            max_requests_per_second: parse_var(
                &lookup,
                "MAX_REQUESTS_PER_SECOND",
                DEFAULT_MAX_REQUESTS_PER_SECOND,
            )?,
            trusted_proxies: parse_list(lookup("TRUSTED_PROXIES")),

            error_reporter_token: lookup("ERROR_REPORTER_TOKEN").filter(|t| !t.is_empty()),

            static_dir: lookup("STATIC_DIR").unwrap_or_else(|| "public".to_string()),
            static_mount: lookup("STATIC_MOUNT").unwrap_or_else(|| "/static".to_string()),

            log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            metrics_port: parse_var(&lookup, "METRICS_PORT", 0)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.environment.is_production() && self.canonical_host.is_empty() {
            return Err(AppError::ConfigError(
                "CANONICAL_HOST must be set in production".to_string(),
            ));
        }

        if self.max_requests_per_second == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUESTS_PER_SECOND must be greater than 0".to_string(),
            ));
        }

        if !self.static_mount.starts_with('/') {
            return Err(AppError::ConfigError(format!(
                "STATIC_MOUNT must start with '/', got '{}'",
                self.static_mount
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        (self.metrics_port > 0)
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            environment: Some(self.environment),
            host: self.canonical_host.clone(),
            max_requests_per_second: self.max_requests_per_second,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }

    pub fn reporter_options(&self) -> ReporterOptions {
        ReporterOptions {
            access_token: self.error_reporter_token.clone(),
            environment: Some(self.environment),
        }
    }

    pub fn static_options(&self) -> StaticOptions {
        StaticOptions::new(self.environment)
    }
}

/// Parse a variable into the specified type with a default value.
fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> AppResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
        None => Ok(default),
    }
}

/// Split a comma-separated variable, dropping empty entries.
fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> AppResult<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            " Prod ".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "development".parse::<Environment>().unwrap(),
            Environment::Development
        );
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_cache_lifetimes() {
        let dev = Environment::Development.cache_lifetimes();
        assert_eq!(dev.hsts, Duration::ZERO);
        assert_eq!(dev.static_assets, Duration::ZERO);

        let prod = Environment::Production.cache_lifetimes();
        assert_eq!(prod.hsts.as_secs(), 31_536_000);
        assert_eq!(prod.static_assets.as_millis(), 31_536_000_000);
    }

    #[test]
    fn test_require_environment() {
        assert_eq!(
            require_environment(Some(Environment::Production), "server").unwrap(),
            Environment::Production
        );
        let err = require_environment(None, "server").unwrap_err();
        assert!(matches!(err, AppError::MissingEnvironment("server")));
    }

    #[test]
    fn test_missing_app_env_is_an_error() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("APP_ENV"));
    }

    #[test]
    fn test_development_defaults() {
        let config = load(&[("APP_ENV", "development")]).unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.server_addr(), "0.0.0.0:3000");
        assert_eq!(config.max_requests_per_second, 5);
        assert!(config.trusted_proxies.is_empty());
        assert!(config.error_reporter_token.is_none());
        assert_eq!(config.static_mount, "/static");
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn test_production_requires_canonical_host() {
        let err = load(&[("APP_ENV", "production")]).unwrap_err();
        assert!(err.to_string().contains("CANONICAL_HOST"));

        let config = load(&[
            ("APP_ENV", "production"),
            ("CANONICAL_HOST", "example.com"),
        ])
        .unwrap();
        assert!(config.environment.is_production());
        assert_eq!(config.canonical_host, "example.com");
    }

    #[test]
    fn test_invalid_numeric_value() {
        let err = load(&[("APP_ENV", "dev"), ("PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let err = load(&[("APP_ENV", "dev"), ("MAX_REQUESTS_PER_SECOND", "0")]).unwrap_err();
        assert!(err.to_string().contains("MAX_REQUESTS_PER_SECOND"));
    }

    #[test]
    fn test_trusted_proxies_list() {
        let config = load(&[
            ("APP_ENV", "dev"),
            ("TRUSTED_PROXIES", "10.0.0.0/8, ,172.16.0.0/12"),
        ])
        .unwrap();
        assert_eq!(config.trusted_proxies, vec!["10.0.0.0/8", "172.16.0.0/12"]);
    }

    #[test]
    fn test_derived_options_carry_environment() {
        let config = load(&[
            ("APP_ENV", "production"),
            ("CANONICAL_HOST", "example.com"),
            ("MAX_REQUESTS_PER_SECOND", "10"),
            ("ERROR_REPORTER_TOKEN", "https://key@o0.ingest.example.com/1"),
        ])
        .unwrap();

        let server = config.server_options();
        assert_eq!(server.environment, Some(Environment::Production));
        assert_eq!(server.host, "example.com");
        assert_eq!(server.max_requests_per_second, 10);

        let reporter = config.reporter_options();
        assert_eq!(reporter.environment, Some(Environment::Production));
        assert!(reporter.access_token.is_some());

        assert_eq!(
            config.static_options().environment,
            Some(Environment::Production)
        );
    }
}
