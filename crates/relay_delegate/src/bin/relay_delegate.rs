// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use relay_delegate::{discover, DelegateSession, Opts, RelayExecutor, ReqwestTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let host = opts.host()?;

    let jar = ReqwestTransport::cookie_jar(&opts.origin, opts.cookies.iter().map(String::as_str));
    let transport = ReqwestTransport::new(jar, !opts.buffer_uploads)
        .context("building HTTP client")?;
    let executor = RelayExecutor::new(Arc::new(transport));

    let manifest = discover(&opts.server).await?;
    let server = Url::parse(&manifest.server_origin)
        .with_context(|| format!("parsing server origin {:?}", manifest.server_origin))?;
    let session = DelegateSession::new(server, host.clone(), executor);
    info!("Serving {host} for {}", manifest.server_origin);

    let serve_forever = async {
        loop {
            match session.run().await {
                Ok(()) => info!("Channel closed, reconnecting..."),
                Err(err) => warn!("Channel failed: {err}"),
            }
            tokio::time::sleep(opts.reconnect_delay()).await;
        }
    };

    tokio::select! {
        _ = serve_forever => {},
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }
    Ok(())
}
