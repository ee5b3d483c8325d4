// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request body helpers

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use http::Uri;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use pin_project::pin_project;
use serde::de::DeserializeOwned;

/// Adapts a [`Body`] into a [`Stream`] of its data frames, skipping trailers.
#[pin_project]
pub struct BodyStream<B>(#[pin] pub B);

impl<B> Stream for BodyStream<B>
where
    B: Body,
{
    type Item = Result<B::Data, B::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            return Poll::Ready(match ready!(this.0.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    Some(Ok(data))
                }
                Some(Err(err)) => Some(Err(err)),
                None => None,
            });
        }
    }
}

/// Look up the first query parameter called `name`, percent-decoded.
pub fn str_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("could not read request body: {0}")]
    Read(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read a whole body into memory, refusing anything longer than `limit` bytes.
pub async fn collect_limited<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.is::<LengthLimitError>() => Err(BodyError::TooLarge { limit }),
        Err(err) => Err(BodyError::Read(err)),
    }
}

/// Read a size-limited body and parse it as JSON.
pub async fn json_body<T, B>(body: B, limit: usize) -> Result<T, BodyError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = collect_limited(body, limit).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::executor::block_on;
    use futures::StreamExt;
    use http_body_util::Full;
    use serde::Deserialize;

    #[test]
    fn body_stream_yields_data() {
        let stream = BodyStream(Full::new(Bytes::from_static(b"hello")));
        let chunks: Vec<_> = block_on(stream.collect::<Vec<_>>());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &Bytes::from_static(b"hello"));
    }

    #[test]
    fn str_param_decodes() {
        let uri: Uri = "/v1/archives/x/entries?name=dir%2Fa%20b.txt&other=1"
            .parse()
            .unwrap();
        assert_eq!(str_param(&uri, "name").as_deref(), Some("dir/a b.txt"));
        assert_eq!(str_param(&uri, "other").as_deref(), Some("1"));
        assert_eq!(str_param(&uri, "missing"), None);

        let uri: Uri = "/v1/archives".parse().unwrap();
        assert_eq!(str_param(&uri, "name"), None);
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let body = Full::new(Bytes::from(vec![b'a'; 128]));
        let err = block_on(collect_limited(body, 100)).unwrap_err();
        assert!(matches!(err, BodyError::TooLarge { limit: 100 }));
    }

    #[test]
    fn json_bodies_parse() {
        #[derive(Debug, Deserialize)]
        struct Fetch {
            url: String,
        }
        let body = Full::new(Bytes::from_static(br#"{"url":"https://a/b"}"#));
        let fetch: Fetch = block_on(json_body(body, 1024)).unwrap();
        assert_eq!(fetch.url, "https://a/b");

        let body = Full::new(Bytes::from_static(b"{nope"));
        let err = block_on(json_body::<Fetch, _>(body, 1024)).unwrap_err();
        assert!(matches!(err, BodyError::Json(_)));
    }
}
