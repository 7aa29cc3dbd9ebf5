//! Routes of the bundled application.
//!
//! ```text
//! GET /health            → JSON liveness report
//! GET <STATIC_MOUNT>/*   → files under STATIC_DIR, cached per environment
//! ```
//!
//! The router is wrapped in the error handler here; the hardening layers are
//! added afterwards by [`crate::server::secure_app`].

use axum::Router;
use axum::routing::get;

use crate::config::Config;
use crate::error::AppResult;
use crate::handlers;
use crate::reporting::{ErrorReporter, error_handler};
use crate::static_files::serve_static;

/// Build the application router.
///
/// # Errors
///
/// Returns an error if the static asset server cannot be configured.
pub fn build_router(config: &Config, reporter: Option<&ErrorReporter>) -> AppResult<Router> {
    let assets = serve_static(&config.static_dir, &config.static_options())?;

    let router = Router::new().route("/health", get(handlers::health_check));

    // axum does not nest at the root
    let router = if config.static_mount == "/" {
        router.fallback_service(assets)
    } else {
        router.nest_service(&config.static_mount, assets)
    };

    Ok(router.layer(error_handler(reporter)))
}
