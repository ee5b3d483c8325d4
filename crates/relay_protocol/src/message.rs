// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages exchanged over a delegate channel.
//!
//! Each frame is a JSON object carrying a `correlationId` and an `op` tag:
//!
//! * server to delegate: `{"correlationId": 7, "op": "fetch", "url": ..., "headers": [[k, v]], "destination": ...}`
//! * delegate to server: `{"correlationId": 7, "op": "success"}` or
//!   `{"correlationId": 7, "op": "error", "error": "..."}`

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Pairs an outbound request with its response on a single channel.
///
/// Ids only need to be unique among the calls currently pending on one channel.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    /// The id after this one.
    ///
    /// Wraps back to 0 after `u32::MAX`. The bound keeps ids exactly representable as JSON
    /// numbers in JavaScript delegates.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A message body tagged with the id of the call it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub body: T,
}

/// Instructions the server sends to a delegate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Fetch(FetchRequest),
}

/// Fetch `url` with the delegate's own credentials and upload the body to `destination`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    pub destination: String,
}

/// How a delegate reports the end of a call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error { error: String },
}

impl Outcome {
    pub fn error(cause: impl ToString) -> Self {
        Self::Error {
            error: cause.to_string(),
        }
    }
}

/// A closed set of `op` tags that may appear in one direction of the channel.
pub trait Message: Serialize + DeserializeOwned {
    const OPS: &'static [&'static str];
}

impl Message for Request {
    const OPS: &'static [&'static str] = &["fetch"];
}

impl Message for Outcome {
    const OPS: &'static [&'static str] = &["success", "error"];
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported op {op:?}")]
    UnsupportedOp {
        correlation_id: Option<CorrelationId>,
        op: String,
    },
    #[error("malformed frame: {source}")]
    Malformed {
        correlation_id: Option<CorrelationId>,
        source: serde_json::Error,
    },
    #[error("could not encode frame: {0}")]
    Encode(serde_json::Error),
}

impl ProtocolError {
    /// The id of the call the rejected frame belonged to, when it could be recovered.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::UnsupportedOp { correlation_id, .. } | Self::Malformed { correlation_id, .. } => {
                *correlation_id
            }
            Self::Encode(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct Probe {
    #[serde(rename = "correlationId")]
    correlation_id: Option<CorrelationId>,
    op: Option<String>,
}

impl<T: Message> Envelope<T> {
    pub fn new(correlation_id: CorrelationId, body: T) -> Self {
        Self {
            correlation_id,
            body,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode a frame, rejecting any `op` outside of `T::OPS` explicitly.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let source = match serde_json::from_str::<Self>(frame) {
            Ok(envelope) => return Ok(envelope),
            Err(source) => source,
        };
        match serde_json::from_str::<Probe>(frame) {
            Ok(Probe {
                correlation_id,
                op: Some(op),
            }) if !T::OPS.contains(&op.as_str()) => {
                Err(ProtocolError::UnsupportedOp { correlation_id, op })
            }
            Ok(Probe { correlation_id, .. }) => Err(ProtocolError::Malformed {
                correlation_id,
                source,
            }),
            Err(_) => Err(ProtocolError::Malformed {
                correlation_id: None,
                source,
            }),
        }
    }
}
