// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::{crate_version, Args, Parser};
use serde::{Deserialize, Deserializer};

use relay_http::cors::DEFAULT_ALLOWED_ORIGINS;

#[derive(Debug, Parser)]
#[clap(
    name = "relay_server",
    about = "Archives remote files fetched through per-origin delegates",
    version = crate_version!()
)]
pub struct Opts {
    #[arg(
        long,
        env = "RELAY_CFG_PATH",
        help = "The path to the server config TOML",
        exclusive = true
    )]
    pub cfg_path: Option<PathBuf>,

    #[command(flatten)]
    pub config: Config,
}

impl Opts {
    /// The config from the TOML file given by `--cfg-path`, or else from the command line.
    pub async fn into_config(self) -> anyhow::Result<Config> {
        match self.cfg_path {
            Some(path) => Config::read_toml(&path).await,
            None => Ok(self.config),
        }
    }
}

#[derive(Clone, Debug, Args, Deserialize)]
pub struct Config {
    #[arg(
        long,
        env = "RELAY_PORT",
        help = "Address to listen on; if only a port is specified, all IPv4 addresses are used.",
        value_parser = parse_port_or_socket_addr,
        default_value = "8080"
    )]
    #[serde(
        default = "Config::default_port",
        deserialize_with = "deserialize_port_or_socket_addr"
    )]
    pub port: SocketAddr,

    #[arg(
        long,
        help = "Maximum simultaneous connections that may be accepted before the server returns 503",
        env = "RELAY_MAX_CONNECTIONS",
        default_value_t = Config::default_max_connections()
    )]
    #[serde(default = "Config::default_max_connections")]
    pub max_connections: usize,

    #[arg(
        long,
        help = "Directory that every archive is written beneath",
        env = "RELAY_ARCHIVE_ROOT",
        default_value_os_t = Config::default_archive_root()
    )]
    #[serde(default = "Config::default_archive_root")]
    pub archive_root: PathBuf,

    #[arg(
        long,
        help = "Origin delegates use to reach this server, e.g. https://relay.example.org. Defaults to http:// plus the listening address.",
        env = "RELAY_PUBLIC_ORIGIN"
    )]
    pub public_origin: Option<String>,

    #[arg(
        long,
        help = "Regex matching the browser origins that get CORS headers",
        env = "RELAY_TRUSTED_ORIGINS",
        default_value = DEFAULT_ALLOWED_ORIGINS
    )]
    #[serde(default = "Config::default_trusted_origins")]
    pub trusted_origins: String,

    #[arg(
        long,
        help = "Size limit for JSON request bodies",
        env = "RELAY_JSON_SIZE_LIMIT",
        default_value_t = Config::default_json_size_limit()
    )]
    #[serde(default = "Config::default_json_size_limit")]
    pub json_size_limit: usize,

    #[arg(
        long,
        help = "Seconds to wait for a delegate to finish a fetch before giving up. Unlimited if unset.",
        env = "RELAY_CALL_TIMEOUT_SECS"
    )]
    pub call_timeout_secs: Option<u64>,

    #[arg(
        long,
        help = "Delegate build to serve from /v1/delegate/artifact",
        env = "RELAY_DELEGATE_ARTIFACT"
    )]
    pub delegate_artifact: Option<PathBuf>,
}

impl Config {
    pub fn default_port() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 8080))
    }

    pub fn default_max_connections() -> usize {
        1024
    }

    pub fn default_archive_root() -> PathBuf {
        "archives".into()
    }

    pub fn default_trusted_origins() -> String {
        DEFAULT_ALLOWED_ORIGINS.to_owned()
    }

    pub fn default_json_size_limit() -> usize {
        100000
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    /// Read a config from TOML, resolving its relative paths against the file's directory.
    pub async fn read_toml(path: &Path) -> anyhow::Result<Self> {
        let config = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Couldn't open config TOML: {path:?}"))?;
        let config: Self =
            toml::from_str(&config).with_context(|| format!("Couldn't parse as TOML: {path:?}"))?;
        let parent_path = path.parent().unwrap_or(".".as_ref());
        Ok(config.relative_to(parent_path))
    }

    pub fn relative_to(mut self, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        self.archive_root = base.join(self.archive_root);
        self.delegate_artifact = self.delegate_artifact.map(|p| base.join(p));
        self
    }
}

fn parse_port_or_socket_addr(arg: &str) -> Result<SocketAddr, <SocketAddr as FromStr>::Err> {
    match u16::from_str(arg) {
        Ok(port) => Ok(SocketAddr::from(([0, 0, 0, 0], port))),
        Err(_) => SocketAddr::from_str(arg),
    }
}

fn deserialize_port_or_socket_addr<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortOrAddr {
        Port(u16),
        Addr(String),
    }

    match PortOrAddr::deserialize(deserializer)? {
        PortOrAddr::Port(port) => Ok(SocketAddr::from(([0, 0, 0, 0], port))),
        PortOrAddr::Addr(addr) => {
            parse_port_or_socket_addr(&addr).map_err(serde::de::Error::custom)
        }
    }
}
