//! Fuzz the parsers that see untrusted or operator-supplied strings.
//!
//! - `CidrRange::parse`: `TRUSTED_PROXIES` entries
//! - `strip_port`: `Host` header values
//! - `extract_client_ip`: `X-Forwarded-For` / `X-Real-IP` values
//! - `Environment` parsing: `APP_ENV`
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_headers -- -max_total_time=60
//! ```

#![no_main]

use axum::http::{HeaderValue, Request};
use libfuzzer_sys::fuzz_target;
use prod_shield::Environment;
use prod_shield::middleware::security::strip_port;
use prod_shield::middleware::{CidrRange, extract_client_ip};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Some(range) = CidrRange::parse(s) {
            // A parsed range must contain its own network address
            if let Some((addr, _)) = s.trim().split_once('/')
                && let Ok(ip) = addr.parse()
            {
                assert!(range.contains(&ip));
            }
        }

        let stripped = strip_port(s);
        assert!(s.contains(stripped));

        let _ = s.parse::<Environment>();
    }

    if let Ok(value) = HeaderValue::from_bytes(data) {
        let mut req = Request::new(());
        req.headers_mut().insert("x-forwarded-for", value.clone());
        req.headers_mut().insert("x-real-ip", value);
        let ip = extract_client_ip(&req);
        assert!(!ip.is_empty());
    }
});
