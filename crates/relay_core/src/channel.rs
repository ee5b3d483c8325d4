// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport-agnostic duplex channel to one delegate.

use std::fmt;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::rpc::RpcPeer;

/// Identity of one channel for as long as the process lives.
///
/// Two channels for the same origin host (e.g. after a reconnect) always have distinct ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Send half of a channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Channel {
    id: ChannelId,
    sender: mpsc::UnboundedSender<String>,
}

/// Frames waiting to be written to the delegate by whatever transport carries the channel.
///
/// Dropping this is how a transport signals that nothing more can be sent.
#[derive(Debug)]
pub struct Outbound {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Channel {
    pub fn open() -> (Channel, Outbound) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Channel {
            id: ChannelId::fresh(),
            sender,
        };
        (channel, Outbound { receiver })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue `frame` for the delegate.
    pub fn send(&self, frame: String) -> Result<(), ChannelClosed> {
        self.sender.send(frame).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Stream for Outbound {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.receiver.poll_recv(cx)
    }
}

/// Feed every inbound frame of a transport to `peer` until the transport ends.
///
/// Frames the peer can't make sense of are logged and skipped; they never end the channel.
/// Once `inbound` is exhausted or fails, `peer` is closed, which fails every call still
/// pending on it.
pub async fn drive<S, E>(peer: &RpcPeer, inbound: S)
where
    S: Stream<Item = Result<String, E>>,
    E: fmt::Display,
{
    let mut inbound = pin!(inbound);
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(frame) => {
                debug!("Received {} byte frame", frame.len());
                if let Err(err) = peer.handle_frame(&frame) {
                    warn!("Rejected frame from delegate: {err}");
                }
            }
            Err(err) => {
                warn!("Delegate transport failed: {err}");
                break;
            }
        }
    }
    info!("Delegate channel {} ended", peer.channel_id());
    peer.close();
}
