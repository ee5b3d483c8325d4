// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bootstrap document served to delegates.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{CHANNEL_PATH, PROTOCOL_VERSION, UPLOAD_PATH};

/// Tells a delegate which protocol the server speaks and where to reach it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateManifest {
    pub protocol_version: u32,
    pub server_origin: String,
    pub channel_path: String,
    pub upload_path: String,
}

impl DelegateManifest {
    pub fn new(server_origin: &Url) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_origin: server_origin.origin().ascii_serialization(),
            channel_path: CHANNEL_PATH.to_owned(),
            upload_path: UPLOAD_PATH.to_owned(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

/// Websocket URL a delegate serving `host` connects to on `server`.
///
/// `http` servers map to `ws`, `https` servers to `wss`.
pub fn channel_url(server: &Url, host: &str) -> Result<Url, url::ParseError> {
    let scheme = match server.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let origin = server.origin().ascii_serialization();
    let authority = origin
        .split_once("://")
        .map_or(origin.as_str(), |(_, authority)| authority);
    Url::parse(&format!("{scheme}://{authority}{CHANNEL_PATH}{host}"))
}
