// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deriving registry keys from URLs.

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    #[error("invalid URL {url:?}: {reason}")]
    Invalid { url: String, reason: String },
    #[error("unsupported scheme {0:?}, only http and https URLs can be relayed")]
    UnsupportedScheme(String),
    #[error("URL {0:?} has no host")]
    MissingHost(String),
}

/// Normalizes a host the way delegates announce it: trimmed and lowercased.
pub fn normalize_host(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

/// Registry key for `url`: its host, plus `:port` when the port isn't the scheme's default.
pub fn origin_key(url: &str) -> Result<String, OriginError> {
    let parsed = Url::parse(url).map_err(|err| OriginError::Invalid {
        url: url.to_owned(),
        reason: err.to_string(),
    })?;
    url_origin_key(&parsed)
}

/// Same as [`origin_key`] for an already parsed URL.
pub fn url_origin_key(url: &Url) -> Result<String, OriginError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OriginError::UnsupportedScheme(url.scheme().to_owned()));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| OriginError::MissingHost(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{port}", normalize_host(host)),
        None => normalize_host(host),
    })
}
