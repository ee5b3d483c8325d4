// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use relay_protocol::OriginError;

use crate::archive::ArchiveError;
use crate::paths::{EntryNameError, PathError};
use crate::rpc::CallError;
use crate::session::ArchiveId;
use crate::tickets::TicketError;

/// Everything that can stop an archive operation or a relayed fetch.
///
/// Causes reported by a delegate are carried verbatim in [`RelayError::Relay`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("archive {0} not found")]
    ArchiveNotFound(ArchiveId),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("output path {0:?} is already used by an open archive")]
    PathInUse(String),
    #[error(transparent)]
    InvalidEntryName(#[from] EntryNameError),
    #[error(transparent)]
    InvalidUrl(#[from] OriginError),
    #[error("no delegate registered for {host}")]
    NoDelegate { host: String },
    #[error("{cause}")]
    Relay { cause: String },
    #[error(transparent)]
    InvalidTicket(#[from] TicketError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("relay interrupted: the delegate's channel closed")]
    Interrupted,
    #[error("relay timed out after {0:?}")]
    TimedOut(Duration),
}

impl RelayError {
    pub fn relay(cause: impl ToString) -> Self {
        Self::Relay {
            cause: cause.to_string(),
        }
    }
}

impl From<CallError> for RelayError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Closed => Self::Interrupted,
            CallError::TimedOut(deadline) => Self::TimedOut(deadline),
            CallError::Protocol(_) | CallError::Encode(_) => Self::relay(err),
        }
    }
}
