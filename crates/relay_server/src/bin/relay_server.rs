// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use relay_server::{run_server, Opts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = Opts::parse().into_config().await?;
    let listener = TcpListener::bind(config.port)
        .await
        .with_context(|| format!("binding {}", config.port))?;
    run_server(config, listener, async {}, std::future::pending()).await
}
