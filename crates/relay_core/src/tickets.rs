// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-use upload tickets.
//!
//! A delegate proves that an upload is one the server asked for by presenting the ticket
//! embedded in the destination URL it was given. Each ticket names exactly one archive entry
//! and can be used once.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::session::ArchiveId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UploadTicket(Uuid);

impl fmt::Display for UploadTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for UploadTicket {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TicketStatus {
    /// Handed to a delegate, no upload seen yet.
    Issued,
    /// An upload is being written.
    Claimed,
    Completed { size: u64 },
    Failed { cause: String },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("unknown or expired upload ticket")]
    Unknown,
    #[error("upload ticket has already been used")]
    AlreadyUsed,
}

/// What claiming a ticket grants.
#[derive(Debug)]
pub struct Claim {
    pub archive: ArchiveId,
    pub entry: String,
    /// Resolves (with an error) once the ticket is revoked.
    pub revoked: oneshot::Receiver<()>,
}

struct Ticket {
    archive: ArchiveId,
    entry: String,
    status: TicketStatus,
    /// Dropped on revocation, which wakes the claimant.
    claimant: Option<oneshot::Sender<()>>,
}

/// Outstanding upload tickets.
#[derive(Default)]
pub struct TicketBook {
    tickets: Mutex<HashMap<UploadTicket, Ticket>>,
}

impl TicketBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a ticket allowing one upload into entry `entry` of `archive`.
    pub fn issue(&self, archive: ArchiveId, entry: &str) -> UploadTicket {
        let ticket = UploadTicket(Uuid::new_v4());
        self.tickets().insert(
            ticket,
            Ticket {
                archive,
                entry: entry.to_owned(),
                status: TicketStatus::Issued,
                claimant: None,
            },
        );
        ticket
    }

    /// Use up `ticket`, returning the archive entry it grants.
    pub fn claim(&self, ticket: &UploadTicket) -> Result<Claim, TicketError> {
        let mut tickets = self.tickets();
        let ticket = tickets.get_mut(ticket).ok_or(TicketError::Unknown)?;
        if ticket.status != TicketStatus::Issued {
            return Err(TicketError::AlreadyUsed);
        }
        let (claimant, revoked) = oneshot::channel();
        ticket.status = TicketStatus::Claimed;
        ticket.claimant = Some(claimant);
        Ok(Claim {
            archive: ticket.archive,
            entry: ticket.entry.clone(),
            revoked,
        })
    }

    /// Record how the upload made with a claimed ticket ended. Ignored for revoked tickets.
    pub fn settle(&self, ticket: &UploadTicket, status: TicketStatus) {
        if let Some(ticket) = self.tickets().get_mut(ticket) {
            ticket.status = status;
        }
    }

    /// Invalidate `ticket`, returning what became of it. An upload still being made with it
    /// is told to stop through [`Claim::revoked`].
    pub fn revoke(&self, ticket: &UploadTicket) -> Option<TicketStatus> {
        self.tickets().remove(ticket).map(|ticket| ticket.status)
    }

    pub fn outstanding(&self) -> usize {
        self.tickets().len()
    }

    fn tickets(&self) -> MutexGuard<'_, HashMap<UploadTicket, Ticket>> {
        self.tickets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
