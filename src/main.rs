use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use prod_shield::reporting::ErrorReporter;
use prod_shield::{Config, build_router, metrics, secure_app};

fn main() -> ExitCode {
    init_logging();

    info!("Starting prod_shield v{}", env!("CARGO_PKG_VERSION"));

    match run() {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// `RUST_LOG` filter (default `info`), JSON lines when `LOG_FORMAT=json`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        environment = %config.environment,
        host = %config.host,
        port = %config.port,
        canonical_host = %config.canonical_host,
        "Configuration loaded"
    );

    // Sentry starts before the runtime so its worker threads inherit the hub.
    // The reporter is dropped after the runtime, flushing queued events.
    let reporter = ErrorReporter::init(&config.reporter_options()).map_err(|e| {
        error!("Failed to initialize error reporting: {e}");
        exitcode::CONFIG
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error!("Failed to start async runtime: {e}");
            exitcode::OSERR
        })?;

    runtime.block_on(serve(&config, reporter.as_ref()))
}

async fn serve(
    config: &Config,
    reporter: Option<&ErrorReporter>,
) -> Result<(), exitcode::ExitCode> {
    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    let app = build_router(config, reporter).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    let server = secure_app(app, &config.server_options()).map_err(|e| {
        error!("Failed to secure application: {e}");
        exitcode::CONFIG
    })?;

    info!("API endpoints:");
    info!("  GET  /health           - Health check");
    info!(
        "  GET  {}/*  - Static assets from '{}'",
        config.static_mount.trim_end_matches('/'),
        config.static_dir
    );

    server.listen(config.server_addr()).await.map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })
}
