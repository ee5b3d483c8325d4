// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CORS headers for browser-hosted clients

use http::{header, HeaderMap, HeaderName, HeaderValue};
use regex::bytes::Regex;

/// Origins allowed when nothing else is configured: local development pages only.
pub const DEFAULT_ALLOWED_ORIGINS: &str = r"^https?://(localhost|127\.0\.0\.1|\[::1\])(:\d+)?$";

const BASE_CORS_HEADERS: [(&str, &str); 3] = [
    (
        "access-control-allow-methods",
        "POST, GET, PUT, DELETE, OPTIONS",
    ),
    (
        "access-control-allow-headers",
        "Accept, Accept-Encoding, Content-Type, Content-Length, Origin, X-Request-Id",
    ),
    ("access-control-allow-credentials", "true"),
];

/// If the `Origin` of `request_headers` matches `allowed`, add CORS headers to
/// `response_headers`, mirroring the origin in `Access-Control-Allow-Origin`.
/// Otherwise, do nothing.
pub fn add_cors_headers(
    request_headers: &HeaderMap,
    response_headers: &mut HeaderMap,
    allowed: &Regex,
) {
    let Some(origin) = request_headers.get(header::ORIGIN) else {
        return;
    };
    if !allowed.is_match(origin.as_bytes()) {
        return;
    }
    response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    response_headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    for (name, value) in BASE_CORS_HEADERS {
        response_headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_regex() -> Regex {
        Regex::new(DEFAULT_ALLOWED_ORIGINS).unwrap()
    }

    fn with_origin(origin: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static(origin));
        headers
    }

    #[test]
    fn can_add_cors_headers() {
        let mut headers = HeaderMap::new();
        // catches panics from non-canonical header names
        add_cors_headers(
            &with_origin("http://localhost:5173"),
            &mut headers,
            &default_regex(),
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:5173"
        );
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[test]
    fn untrusted_origins_get_nothing() {
        let mut headers = HeaderMap::new();
        add_cors_headers(
            &with_origin("https://evil.example"),
            &mut headers,
            &default_regex(),
        );
        assert!(headers.is_empty());

        add_cors_headers(&HeaderMap::new(), &mut headers, &default_regex());
        assert!(headers.is_empty());
    }

    #[test]
    fn default_origins() {
        let regex = default_regex();
        assert!(regex.is_match(b"http://localhost"));
        assert!(regex.is_match(b"http://localhost:1234"));
        assert!(regex.is_match(b"https://127.0.0.1:8443"));
        assert!(regex.is_match(b"http://[::1]:80"));

        assert!(!regex.is_match(b"http://localho.st"));
        assert!(!regex.is_match(b"http://localhost.example.org"));
        assert!(!regex.is_match(b"ftp://localhost"));
    }

    #[test]
    fn custom_origins() {
        let regex = Regex::new(r"^https://(\w+\.)*example\.org$").unwrap();
        let mut headers = HeaderMap::new();
        add_cors_headers(&with_origin("https://app.example.org"), &mut headers, &regex);
        assert!(!headers.is_empty());
    }
}
