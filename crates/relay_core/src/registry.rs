// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Which delegate answers for which origin host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use relay_protocol::normalize_host;
use tracing::info;

use crate::rpc::RpcPeer;

/// At most one delegate per origin host; the most recent registration wins.
///
/// Lookups never wait: a host without a delegate is simply absent.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: Mutex<HashMap<String, Arc<RpcPeer>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` the delegate for `host`, returning the one it replaces.
    ///
    /// The replaced peer is left open; whoever drives its transport still owns it.
    pub fn register(&self, host: &str, peer: Arc<RpcPeer>) -> Option<Arc<RpcPeer>> {
        let host = normalize_host(host);
        info!("Delegate {} registered for {host}", peer.channel_id());
        self.proxies().insert(host, peer)
    }

    /// Remove `peer` as the delegate for `host`, unless it has already been replaced.
    ///
    /// Returns whether anything was removed.
    pub fn unregister(&self, host: &str, peer: &RpcPeer) -> bool {
        let host = normalize_host(host);
        let mut proxies = self.proxies();
        match proxies.get(&host) {
            Some(current) if current.channel_id() == peer.channel_id() => {
                proxies.remove(&host);
                info!("Delegate {} unregistered from {host}", peer.channel_id());
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, host: &str) -> Option<Arc<RpcPeer>> {
        self.proxies().get(&normalize_host(host)).cloned()
    }

    /// Hosts that currently have a delegate, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.proxies().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    fn proxies(&self) -> MutexGuard<'_, HashMap<String, Arc<RpcPeer>>> {
        self.proxies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
