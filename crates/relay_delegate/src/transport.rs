// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::cookie::Jar;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::error::{DelegateError, TransportError};

/// A response body, chunk by chunk.
pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Result of a fetch made with the delegate's own credentials.
pub struct FetchedBody {
    pub status: StatusCode,
    pub body: ChunkStream,
}

pub enum UploadBody {
    /// Forwarded chunk by chunk as it is fetched.
    Streamed(ChunkStream),
    /// Fully read before uploading.
    Buffered(Bytes),
}

/// The HTTP capabilities a delegate needs.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync {
    /// GET `url` with the delegate's ambient credentials plus `headers`.
    async fn fetch(&self, url: &str, headers: &[(String, String)])
        -> Result<FetchedBody, TransportError>;

    /// PUT `body` to `destination`, returning the response status.
    async fn upload(&self, destination: &str, body: UploadBody)
        -> Result<StatusCode, TransportError>;

    /// Whether [`upload`](Self::upload) can take an [`UploadBody::Streamed`]. When it can't,
    /// whole bodies are held in memory before uploading.
    fn supports_streaming_upload(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client, // cheaply cloneable (Arc<...> internally), see docs
    streaming_uploads: bool,
}

impl ReqwestTransport {
    /// A transport sending the cookies in `jar` wherever they apply.
    pub fn new(jar: Arc<Jar>, streaming_uploads: bool) -> Result<Self, DelegateError> {
        let client = reqwest::ClientBuilder::new()
            .cookie_provider(jar)
            .build()?;
        Ok(Self {
            client,
            streaming_uploads,
        })
    }

    /// A cookie jar holding `cookies` (in `Set-Cookie` syntax) for `origin`.
    pub fn cookie_jar<'a>(origin: &Url, cookies: impl IntoIterator<Item = &'a str>) -> Arc<Jar> {
        let jar = Jar::default();
        for cookie in cookies {
            jar.add_cookie_str(cookie, origin);
        }
        Arc::new(jar)
    }
}

#[async_trait::async_trait]
impl RelayTransport for ReqwestTransport {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<FetchedBody, TransportError> {
        let mut rb = self.client.get(url);
        for (key, value) in headers {
            rb = rb.header(key.as_str(), value.as_str());
        }

        debug!("relay_delegate: fetching {url}");
        let response = rb.send().await?;
        debug!("relay_delegate: response from {url:?}: {}", response.status());

        Ok(FetchedBody {
            status: response.status(),
            body: response.bytes_stream().map_err(TransportError::from).boxed(),
        })
    }

    async fn upload(
        &self,
        destination: &str,
        body: UploadBody,
    ) -> Result<StatusCode, TransportError> {
        let body = match body {
            UploadBody::Streamed(chunks) => reqwest::Body::wrap_stream(chunks),
            UploadBody::Buffered(bytes) => reqwest::Body::from(bytes),
        };
        let response = self
            .client
            .put(destination)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        debug!(
            "relay_delegate: upload to {destination:?}: {}",
            response.status()
        );
        Ok(response.status())
    }

    fn supports_streaming_upload(&self) -> bool {
        self.streaming_uploads
    }
}

pub mod test_utils {
    use super::*;

    use std::sync::Mutex;

    /// In-memory [`RelayTransport`] that serves canned responses and records uploads.
    pub struct MockTransport {
        pub fetch_status: StatusCode,
        pub chunks: Vec<&'static [u8]>,
        pub upload_status: StatusCode,
        pub streaming: bool,
        pub panic_on_fetch: bool,
        pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                fetch_status: StatusCode::OK,
                chunks: vec![],
                upload_status: StatusCode::OK,
                streaming: true,
                panic_on_fetch: false,
                uploads: Mutex::default(),
            }
        }
    }

    impl MockTransport {
        /// Every upload received so far, as `(destination, body)`.
        pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
            self.uploads.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl RelayTransport for MockTransport {
        async fn fetch(
            &self,
            _url: &str,
            _headers: &[(String, String)],
        ) -> Result<FetchedBody, TransportError> {
            if self.panic_on_fetch {
                panic!("mock transport asked to panic");
            }
            let chunks: Vec<Result<Bytes, TransportError>> = self
                .chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect();
            Ok(FetchedBody {
                status: self.fetch_status,
                body: futures::stream::iter(chunks).boxed(),
            })
        }

        async fn upload(
            &self,
            destination: &str,
            body: UploadBody,
        ) -> Result<StatusCode, TransportError> {
            let body = match body {
                UploadBody::Streamed(chunks) => {
                    let chunks: Vec<Bytes> = chunks.try_collect().await?;
                    chunks.concat()
                }
                UploadBody::Buffered(bytes) => bytes.to_vec(),
            };
            self.uploads
                .lock()
                .unwrap()
                .push((destination.to_owned(), body));
            Ok(self.upload_status)
        }

        fn supports_streaming_upload(&self) -> bool {
            self.streaming
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use reqwest::cookie::CookieStore;

    #[test]
    fn seeded_cookies_only_go_to_their_origin() {
        let origin = Url::parse("https://origin2").unwrap();
        let jar = ReqwestTransport::cookie_jar(&origin, ["session=abc"]);
        let sent = jar.cookies(&origin.join("/private").unwrap()).unwrap();
        assert_eq!(sent, "session=abc");
        assert!(jar
            .cookies(&Url::parse("https://elsewhere").unwrap())
            .is_none());

        let transport = ReqwestTransport::new(jar, false).unwrap();
        assert!(!transport.supports_streaming_upload());
    }
}
