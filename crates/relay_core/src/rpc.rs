// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request/response calls over a one-way message [`Channel`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use relay_protocol::{CorrelationId, Envelope, Outcome, ProtocolError, Request};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelId};

/// Why a call produced no [`Outcome`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("channel closed")]
    Closed,
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    #[error("delegate sent an unusable response: {0}")]
    Protocol(String),
    #[error("could not encode request: {0}")]
    Encode(String),
}

type Waiter = oneshot::Sender<Result<Outcome, CallError>>;

struct Pending {
    /// Distinguishes successive calls that happen to get the same id after wraparound.
    call: u64,
    waiter: Waiter,
}

#[derive(Default)]
struct PeerState {
    next_id: CorrelationId,
    calls: u64,
    pending: HashMap<CorrelationId, Pending>,
    closed: bool,
}

/// The server's end of a delegate channel, as something that can be called.
///
/// Any number of calls may be in flight at once and responses may arrive in any order;
/// each is matched to its caller purely by [`CorrelationId`].
pub struct RpcPeer {
    channel: Channel,
    deadline: Option<Duration>,
    state: Mutex<PeerState>,
}

impl RpcPeer {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            deadline: None,
            state: Mutex::default(),
        }
    }

    /// Fail calls that get no response within `deadline`. `None` waits for as long as the
    /// channel stays open.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Issue `request` and wait for the delegate's outcome, using the peer's default deadline.
    pub async fn call(&self, request: Request) -> Result<Outcome, CallError> {
        self.call_with_deadline(request, self.deadline).await
    }

    /// Issue `request` and wait for the delegate's outcome.
    ///
    /// Resolves with [`CallError::Closed`] if the peer is, or becomes, closed before the
    /// outcome arrives. Dropping the returned future forgets the call.
    pub async fn call_with_deadline(
        &self,
        request: Request,
        deadline: Option<Duration>,
    ) -> Result<Outcome, CallError> {
        let (id, call, receiver) = self.register()?;
        let _pending = PendingGuard {
            peer: self,
            id,
            call,
        };

        let frame = Envelope::new(id, request)
            .encode()
            .map_err(|err| CallError::Encode(err.to_string()))?;
        self.channel.send(frame).map_err(|_| CallError::Closed)?;
        debug!("Call {id} sent on {}", self.channel.id());

        let response = async { receiver.await.unwrap_or(Err(CallError::Closed)) };
        match deadline {
            None => response.await,
            Some(deadline) => tokio::time::timeout(deadline, response)
                .await
                .unwrap_or(Err(CallError::TimedOut(deadline))),
        }
    }

    /// Route one inbound frame to the call it answers.
    ///
    /// Responses to calls nobody is waiting for (anymore) are dropped. A frame that can't be
    /// decoded fails the call it names, if it names one, and is returned as an error.
    pub fn handle_frame(&self, frame: &str) -> Result<(), ProtocolError> {
        let (id, result) = match Envelope::<Outcome>::decode(frame) {
            Ok(envelope) => (envelope.correlation_id, Ok(envelope.body)),
            Err(err) => {
                if let Some(id) = err.correlation_id() {
                    if let Some(pending) = self.state().pending.remove(&id) {
                        let _ = pending.waiter.send(Err(CallError::Protocol(err.to_string())));
                    }
                }
                return Err(err);
            }
        };
        match self.state().pending.remove(&id) {
            Some(pending) => {
                // the caller may have given up in the meantime
                let _ = pending.waiter.send(result);
            }
            None => warn!("Dropping response to unknown call {id}"),
        }
        Ok(())
    }

    /// Fail every pending call with [`CallError::Closed`], and every future one too.
    pub fn close(&self) {
        let pending = {
            let mut state = self.state();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            warn!(
                "{} closed with {} pending call(s)",
                self.channel.id(),
                pending.len()
            );
        }
        for (_, pending) in pending {
            let _ = pending.waiter.send(Err(CallError::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of calls currently awaiting an outcome.
    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        // nothing panics while holding the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate an id not currently pending, wrapping after `u32::MAX`.
    fn register(
        &self,
    ) -> Result<(CorrelationId, u64, oneshot::Receiver<Result<Outcome, CallError>>), CallError>
    {
        let mut state = self.state();
        if state.closed {
            return Err(CallError::Closed);
        }
        let mut id = state.next_id;
        while state.pending.contains_key(&id) {
            id = id.next();
        }
        state.next_id = id.next();
        state.calls += 1;
        let call = state.calls;
        let (waiter, receiver) = oneshot::channel();
        state.pending.insert(id, Pending { call, waiter });
        Ok((id, call, receiver))
    }

    #[cfg(test)]
    fn starting_at(self, id: CorrelationId) -> Self {
        self.state().next_id = id;
        self
    }
}

/// Removes a call's pending entry however the call ends, including by being dropped.
struct PendingGuard<'a> {
    peer: &'a RpcPeer,
    id: CorrelationId,
    call: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.peer.state();
        if state
            .pending
            .get(&self.id)
            .is_some_and(|pending| pending.call == self.call)
        {
            state.pending.remove(&self.id);
        }
    }
}
