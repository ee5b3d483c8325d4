// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use clap::{crate_version, Parser};
use url::Url;

use relay_protocol::url_origin_key;

use crate::error::DelegateError;

#[derive(Clone, Debug, Parser)]
#[clap(
    name = "relay_delegate",
    about = "Fetches files for a relay server with this origin's credentials",
    version = crate_version!()
)]
pub struct Opts {
    #[arg(
        long,
        help = "Relay server to register with",
        env = "RELAY_SERVER",
        default_value = "http://127.0.0.1:8080"
    )]
    pub server: Url,

    #[arg(
        long,
        help = "Origin this delegate fetches from, e.g. https://files.example.org",
        env = "RELAY_ORIGIN"
    )]
    pub origin: Url,

    #[arg(
        long = "cookie",
        help = "Cookie to send to the origin, in Set-Cookie syntax. May be repeated.",
        env = "RELAY_COOKIES",
        value_delimiter = '\n'
    )]
    pub cookies: Vec<String>,

    #[arg(
        long,
        help = "Read each fetched file completely before uploading it, instead of streaming",
        env = "RELAY_BUFFER_UPLOADS",
        default_value_t = false
    )]
    pub buffer_uploads: bool,

    #[arg(
        long,
        help = "Seconds to wait before reconnecting after the channel drops",
        env = "RELAY_RECONNECT_DELAY_SECS",
        default_value_t = Opts::default_reconnect_delay_secs()
    )]
    pub reconnect_delay_secs: u64,
}

impl Opts {
    pub fn default_reconnect_delay_secs() -> u64 {
        5
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// The host this delegate registers for, as the server keys it.
    pub fn host(&self) -> Result<String, DelegateError> {
        Ok(url_origin_key(&self.origin)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_and_cookies() {
        let opts = Opts::try_parse_from([
            "relay_delegate",
            "--origin",
            "https://Files.Example.org:8443/ignored",
            "--cookie",
            "session=abc",
            "--cookie",
            "theme=dark; Path=/",
        ])
        .unwrap();
        assert_eq!(opts.host().unwrap(), "files.example.org:8443");
        assert_eq!(opts.cookies, vec!["session=abc", "theme=dark; Path=/"]);
        assert_eq!(opts.server.as_str(), "http://127.0.0.1:8080/");
        assert!(!opts.buffer_uploads);
        assert_eq!(opts.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn origin_is_required() {
        assert!(Opts::try_parse_from(["relay_delegate"]).is_err());
    }
}
