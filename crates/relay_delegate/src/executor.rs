// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Carrying out fetch instructions.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{FutureExt, StreamExt};
use tracing::{info, warn};

use relay_protocol::{FetchRequest, Outcome};

use crate::error::RelayFailure;
use crate::transport::{RelayTransport, UploadBody};

#[derive(Clone)]
pub struct RelayExecutor {
    transport: Arc<dyn RelayTransport>,
}

impl RelayExecutor {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self { transport }
    }

    /// Fetch `request.url` and upload the body to `request.destination`.
    ///
    /// Never fails: errors, and panics in the transport, become [`Outcome::Error`].
    pub async fn execute(&self, request: FetchRequest) -> Outcome {
        let url = request.url.clone();
        match AssertUnwindSafe(self.relay(request)).catch_unwind().await {
            Ok(Ok(size)) => {
                info!("Relayed {url} ({size} bytes)");
                Outcome::Success
            }
            Ok(Err(err)) => {
                warn!("Relaying {url} failed: {err}");
                Outcome::error(err)
            }
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                warn!("Relaying {url} panicked: {message}");
                Outcome::error(RelayFailure::Panicked(message))
            }
        }
    }

    async fn relay(&self, request: FetchRequest) -> Result<u64, RelayFailure> {
        let FetchRequest {
            url,
            headers,
            destination,
        } = request;

        let fetched = self
            .transport
            .fetch(&url, &headers)
            .await
            .map_err(|source| RelayFailure::Fetch {
                url: url.clone(),
                source,
            })?;
        if !fetched.status.is_success() {
            return Err(RelayFailure::FetchStatus {
                url,
                status: fetched.status,
            });
        }

        let (body, size) = if self.transport.supports_streaming_upload() {
            (UploadBody::Streamed(fetched.body), None)
        } else {
            let mut buffer = BytesMut::new();
            let mut chunks = fetched.body;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|source| RelayFailure::FetchBody {
                    url: url.clone(),
                    source,
                })?;
                buffer.extend_from_slice(&chunk);
            }
            let size = buffer.len() as u64;
            (UploadBody::Buffered(buffer.freeze()), Some(size))
        };

        let status = self
            .transport
            .upload(&destination, body)
            .await
            .map_err(|source| RelayFailure::Upload {
                destination: destination.clone(),
                source,
            })?;
        if !status.is_success() {
            return Err(RelayFailure::UploadStatus {
                destination,
                status,
            });
        }
        // streamed sizes are only known to the server
        Ok(size.unwrap_or_default())
    }
}
