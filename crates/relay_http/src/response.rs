// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Response;
pub use hyper::StatusCode;
use serde::Serialize;
use tracing::error;

/// Holds a [`GenericResponse`], possibly wrapped in an [`ErrResponse`].
pub type ResponseResult = Result<GenericResponse, ErrResponse>;

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// Early-return wrapper for handlers: `Err(ErrResponse(r))` is sent to the client as `r`.
pub struct ErrResponse(pub GenericResponse);

impl From<ErrResponse> for GenericResponse {
    fn from(ErrResponse(response): ErrResponse) -> Self {
        response
    }
}

/// Return an empty 200 response.
///
/// Used for CORS preflight requests, where Firefox dislikes 204s.
pub fn empty() -> GenericResponse {
    let body = Empty::new().map_err(anyhow::Error::from).boxed();
    Response::new(body)
}

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl Into<Bytes>,
) -> GenericResponse {
    let body = Full::new(content.into())
        .map_err(anyhow::Error::from)
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "text/plain; charset=utf-8", content.to_string())
}

/// Return a JSON response, serializing `value`.
pub fn json(status: StatusCode, value: &impl Serialize) -> GenericResponse {
    match serde_json::to_vec(value) {
        Ok(body) => full(status, "application/json", body),
        Err(err) => {
            error!("Unable to serialize response: {err}");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Unable to serialize response.")
        }
    }
}

/// Return a binary response.
pub fn octets(status: StatusCode, content: impl Into<Bytes>) -> GenericResponse {
    full(status, "application/octet-stream", content)
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}
