// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use reqwest::StatusCode;

/// Failures of the transport underneath a [`RelayTransport`](crate::RelayTransport).
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a fetch instruction could not be carried out.
///
/// The rendered message is what the server sees as the cause of a failed relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayFailure {
    #[error("fetching {url} failed: {source}")]
    Fetch { url: String, source: TransportError },
    #[error("fetching {url} failed with status {status}")]
    FetchStatus { url: String, status: StatusCode },
    #[error("reading the body of {url} failed: {source}")]
    FetchBody { url: String, source: TransportError },
    #[error("uploading to {destination} failed: {source}")]
    Upload {
        destination: String,
        source: TransportError,
    },
    #[error("uploading to {destination} failed with status {status}")]
    UploadStatus {
        destination: String,
        status: StatusCode,
    },
    #[error("delegate panicked: {0}")]
    Panicked(String),
}

/// Why a delegate session ended.
#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    #[error("while {ctx}: {status_wrap}: {source}", status_wrap=StatusWrapper(*status))]
    RequestError {
        ctx: String,
        status: Option<u16>,
        source: TransportError,
    },
    #[error("server speaks protocol version {server}, this delegate speaks {ours}")]
    IncompatibleProtocol { server: u32, ours: u32 },
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid origin: {0}")]
    InvalidOrigin(#[from] relay_protocol::OriginError),
    #[error("channel failed: {0}")]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

struct StatusWrapper(Option<u16>);

impl std::fmt::Display for StatusWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            None => f.write_str("no status"),
            Some(status) => write!(f, "status: {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_name_the_status() {
        let err = RelayFailure::FetchStatus {
            url: "https://origin2/missing".into(),
            status: StatusCode::NOT_FOUND,
        };
        assert_eq!(
            err.to_string(),
            "fetching https://origin2/missing failed with status 404 Not Found"
        );

        let err = RelayFailure::UploadStatus {
            destination: "http://relay/v1/uploads/abc".into(),
            status: StatusCode::FORBIDDEN,
        };
        assert!(err.to_string().contains("403 Forbidden"));
    }

    #[test]
    fn request_errors_show_missing_statuses() {
        let err = DelegateError::RequestError {
            ctx: "fetching the delegate manifest".into(),
            status: None,
            source: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "while fetching the delegate manifest: no status: connection refused"
        );
    }
}
