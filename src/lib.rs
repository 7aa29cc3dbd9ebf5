//! # prod_shield
//!
//! Production-safety defaults for an axum application:
//!
//! - **HTTPS**: Canonical-host redirects, HSTS and `nosniff` headers
//! - **Access Logs**: Colored dev lines or Apache combined lines via `tracing`
//! - **Rate Limiting**: Per-client ceiling of `60 × rps` requests per minute
//! - **Static Assets**: `Cache-Control` lifetimes that follow the environment
//! - **Error Reporting**: Sentry in production with expected client errors filtered
//! - **Callback Adapter**: Await `(req, res, done)` style middleware
//!
//! Every component takes the deployment [`Environment`] explicitly and refuses
//! to start without it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PreparedServer (axum)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Access Log (dev: immediate, prod: combined)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Security (301 → https://canonical, HSTS, nosniff)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rate Limiter (prod only, 503 when blocked)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Application Router + Error Handler → ReportSink (Sentry)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use prod_shield::{Environment, ServerOptions, secure_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Router::new().route("/", get(|| async { "hello" }));
//!
//!     let options = ServerOptions {
//!         environment: Some(Environment::Production),
//!         host: "example.com".to_string(),
//!         ..Default::default()
//!     };
//!
//!     secure_app(app, &options)?.listen("0.0.0.0:3000").await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod reporting;
pub mod routes;
pub mod server;
pub mod static_files;
pub mod utils;

// Re-exports for convenience
pub use adapter::{Done, MiddlewareError, run_middleware};
pub use config::{Config, Environment};
pub use error::{AppError, AppResult};
pub use reporting::{ErrorReporter, ReporterOptions, error_handler};
pub use routes::build_router;
pub use server::{PreparedServer, ServerOptions, secure_app};
pub use static_files::{StaticOptions, serve_static};
