// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use regex::bytes::Regex;
use tokio::sync::watch;
use tracing::{info, Instrument};
use url::Url;

use relay_core::{ArchiveSessionStore, ConfinedRoot, FetchRelay, ProxyRegistry, ZipFormat};
use relay_http::nursery::Nursery;
use relay_protocol::DelegateManifest;

use crate::Config;

pub struct RelayState {
    pub relay: FetchRelay,
    pub trusted_origins: Regex,
    pub manifest: DelegateManifest,
    pub delegate_artifact: Option<Bytes>,
    pub json_size_limit: usize,
    pub call_timeout: Option<Duration>,
    /// Channel tasks of connected delegates; `None` once shutting down.
    delegates: Mutex<Option<Nursery>>,
    delegates_shutdown: watch::Sender<bool>,
}

impl RelayState {
    pub async fn new(config: &Config, public_origin: &Url) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.archive_root)
            .await
            .with_context(|| format!("creating archive root {:?}", config.archive_root))?;
        let trusted_origins =
            Regex::new(&config.trusted_origins).context("parsing trusted origins regex")?;
        let delegate_artifact = match &config.delegate_artifact {
            Some(path) => Some(Bytes::from(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading delegate artifact {path:?}"))?,
            )),
            None => None,
        };

        let archives = ArchiveSessionStore::new(
            ConfinedRoot::new(&config.archive_root),
            Arc::new(ZipFormat),
        );
        let relay = FetchRelay::new(
            Arc::new(ProxyRegistry::new()),
            Arc::new(archives),
            public_origin.origin().ascii_serialization().as_str(),
        );
        let (delegates_shutdown, _) = watch::channel(false);

        info!("Archives go to {}", config.archive_root.display());
        info!("Delegates upload to {}", public_origin);
        Ok(Self {
            relay,
            trusted_origins,
            manifest: DelegateManifest::new(public_origin),
            delegate_artifact,
            json_size_limit: config.json_size_limit,
            call_timeout: config.call_timeout(),
            delegates: Mutex::new(Some(Nursery::new())),
            delegates_shutdown,
        })
    }

    /// Run a delegate's channel task until it ends or [`shutdown`](Self::shutdown) is called.
    ///
    /// Returns `false`, without running `task`, if already shutting down.
    pub fn spawn_delegate(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        let mut delegates = self
            .delegates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(nursery) = delegates.as_mut() else {
            return false;
        };
        nursery.spawn(task.in_current_span());
        true
    }

    /// Flips to `true` when delegate channels should close.
    pub fn delegate_shutdown(&self) -> watch::Receiver<bool> {
        self.delegates_shutdown.subscribe()
    }

    /// Disconnect every delegate, then finalize every open archive.
    pub async fn shutdown(&self) {
        self.delegates_shutdown.send_replace(true);
        let delegates = self
            .delegates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(delegates) = delegates {
            delegates.finish().await;
        }
        self.relay.archives().close_all().await;
        info!("Relay state shut down");
    }
}
