//! Static asset serving with environment-dependent caching.
//!
//! Files are served by `tower_http`'s [`ServeDir`]. Successful and
//! `304 Not Modified` responses carry `Cache-Control: public, max-age=<secs>`;
//! errors such as a missing file carry none, so a 404 is never cached. The
//! lifetime is zero in development and one year in production unless the
//! caller overrides it.

use std::path::Path;
use std::time::Duration;

use axum::http::{HeaderValue, Response, StatusCode, header};
use tower_http::services::ServeDir;
use tower_http::set_header::{MakeHeaderValue, SetResponseHeader};
use tracing::debug;

use crate::config::{Environment, require_environment};
use crate::error::{AppError, AppResult};

/// Static file service returned by [`serve_static`].
pub type StaticFiles = SetResponseHeader<ServeDir, CacheControl>;

/// `Cache-Control` value applied to cacheable responses only.
#[derive(Debug, Clone)]
pub struct CacheControl(HeaderValue);

impl CacheControl {
    /// `public, max-age=<secs>`
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the value is not a valid header.
    pub fn public(max_age: Duration) -> AppResult<Self> {
        HeaderValue::from_str(&format!("public, max-age={}", max_age.as_secs()))
            .map(Self)
            .map_err(|e| AppError::ConfigError(format!("Invalid Cache-Control value: {e}")))
    }
}

impl<B> MakeHeaderValue<Response<B>> for CacheControl {
    fn make_header_value(&mut self, response: &Response<B>) -> Option<HeaderValue> {
        let status = response.status();
        (status.is_success() || status == StatusCode::NOT_MODIFIED).then(|| self.0.clone())
    }
}

/// Options for [`serve_static`].
#[derive(Debug, Clone)]
pub struct StaticOptions {
    pub environment: Option<Environment>,
    /// Overrides the environment's default cache lifetime
    pub max_age: Option<Duration>,
    /// Serve `<file>.gz` to clients that accept gzip
    pub precompressed_gzip: bool,
    /// Serve `<file>.br` to clients that accept brotli
    pub precompressed_br: bool,
    /// Serve `index.html` for directory requests
    pub append_index_html: bool,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            environment: None,
            max_age: None,
            precompressed_gzip: false,
            precompressed_br: false,
            append_index_html: true,
        }
    }
}

impl StaticOptions {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment: Some(environment),
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Cache lifetime after merging: the environment default first, then the
    /// caller's `max_age` on top.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MissingEnvironment` if no environment was given.
    pub fn effective_max_age(&self) -> AppResult<Duration> {
        let environment = require_environment(self.environment, "static asset server")?;

        let mut max_age = environment.cache_lifetimes().static_assets;
        if let Some(custom) = self.max_age {
            max_age = custom;
        }
        Ok(max_age)
    }
}

/// Serve the files under `root` with the configured cache lifetime.
///
/// ```rust,ignore
/// let assets = serve_static("public", &StaticOptions::new(Environment::Production))?;
/// let app = Router::new().nest_service("/static", assets);
/// ```
///
/// # Errors
///
/// Returns `AppError::MissingEnvironment` if no environment was given.
pub fn serve_static(root: impl AsRef<Path>, options: &StaticOptions) -> AppResult<StaticFiles> {
    let max_age = options.effective_max_age()?;
    let cache_control = CacheControl::public(max_age)?;

    let mut dir = ServeDir::new(root.as_ref())
        .append_index_html_on_directories(options.append_index_html);
    if options.precompressed_gzip {
        dir = dir.precompressed_gzip();
    }
    if options.precompressed_br {
        dir = dir.precompressed_br();
    }

    debug!(
        root = %root.as_ref().display(),
        max_age_secs = max_age.as_secs(),
        "Serving static assets"
    );

    Ok(SetResponseHeader::overriding(
        dir,
        header::CACHE_CONTROL,
        cache_control,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn asset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.css"), "body { margin: 0 }").unwrap();
        dir
    }

    async fn fetch(service: StaticFiles, uri: &str) -> axum::http::Response<Vec<u8>> {
        let response = service
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes().to_vec();
        axum::http::Response::from_parts(parts, bytes)
    }

    #[test]
    fn test_max_age_per_environment() {
        let dev = StaticOptions::new(Environment::Development);
        assert_eq!(dev.effective_max_age().unwrap().as_millis(), 0);

        let prod = StaticOptions::new(Environment::Production);
        assert_eq!(prod.effective_max_age().unwrap().as_millis(), 31_536_000_000);
    }

    #[test]
    fn test_caller_max_age_wins() {
        let options =
            StaticOptions::new(Environment::Production).with_max_age(Duration::from_secs(60));
        assert_eq!(options.effective_max_age().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_environment_is_an_error() {
        let dir = asset_dir();
        let result = serve_static(dir.path(), &StaticOptions::default());
        assert!(matches!(result, Err(AppError::MissingEnvironment(_))));
    }

    #[tokio::test]
    async fn test_production_assets_are_cached_for_a_year() {
        let dir = asset_dir();
        let service =
            serve_static(dir.path(), &StaticOptions::new(Environment::Production)).unwrap();

        let response = fetch(service, "/app.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=31536000"
        );
        assert_eq!(response.body(), b"body { margin: 0 }");
    }

    #[tokio::test]
    async fn test_development_assets_are_not_cached() {
        let dir = asset_dir();
        let service =
            serve_static(dir.path(), &StaticOptions::new(Environment::Development)).unwrap();

        let response = fetch(service, "/app.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=0"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = asset_dir();
        let service =
            serve_static(dir.path(), &StaticOptions::new(Environment::Development)).unwrap();

        let response = fetch(service, "/missing.js").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_not_found_is_never_cached() {
        let dir = asset_dir();
        let service =
            serve_static(dir.path(), &StaticOptions::new(Environment::Production)).unwrap();

        let response = fetch(service, "/missing.js").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
    }

    #[tokio::test]
    async fn test_not_modified_keeps_cache_control() {
        let dir = asset_dir();
        let service =
            serve_static(dir.path(), &StaticOptions::new(Environment::Production)).unwrap();

        let first = fetch(service.clone(), "/app.css").await;
        let last_modified = first.headers().get(header::LAST_MODIFIED).unwrap().clone();

        let response = service
            .oneshot(
                Request::builder()
                    .uri("/app.css")
                    .header(header::IF_MODIFIED_SINCE, last_modified)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=31536000"
        );
    }

    #[test]
    fn test_cache_control_skips_errors() {
        let mut cache = CacheControl::public(Duration::from_secs(60)).unwrap();
        for (status, cached) in [
            (StatusCode::OK, true),
            (StatusCode::PARTIAL_CONTENT, true),
            (StatusCode::NOT_MODIFIED, true),
            (StatusCode::MOVED_PERMANENTLY, false),
            (StatusCode::NOT_FOUND, false),
            (StatusCode::INTERNAL_SERVER_ERROR, false),
        ] {
            let response = Response::builder().status(status).body(()).unwrap();
            assert_eq!(
                cache.make_header_value(&response).is_some(),
                cached,
                "{status}"
            );
        }
    }
}
