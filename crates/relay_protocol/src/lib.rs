// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire contract spoken between the relay server and its delegates.
//!
//! Everything that crosses the duplex channel is defined here, so the server and a separately
//! built delegate only ever have to agree on [`PROTOCOL_VERSION`].

pub mod manifest;
pub mod message;
pub mod origin;

pub use manifest::{channel_url, DelegateManifest};
pub use message::{CorrelationId, Envelope, FetchRequest, Message, Outcome, ProtocolError, Request};
pub use origin::{normalize_host, origin_key, url_origin_key, OriginError};

/// Bumped whenever a message shape changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Path prefix of the channel endpoint; the delegate appends the origin host it serves.
pub const CHANNEL_PATH: &str = "/v1/proxy/";

/// Path prefix of the ingestion endpoint; the server appends a single-use upload ticket.
pub const UPLOAD_PATH: &str = "/v1/uploads/";
