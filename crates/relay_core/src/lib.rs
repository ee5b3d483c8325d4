// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The relay itself: delegate channels, correlated calls over them, the registry that routes
//! fetches to delegates, and the archive sessions that relayed bytes end up in.
//!
//! Nothing in here knows about websockets or HTTP; transports feed frames in through
//! [`channel::drive`] and read them out of [`channel::Outbound`].

pub mod archive;
pub mod channel;
pub mod error;
pub mod paths;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod tickets;

pub use archive::{ArchiveError, ArchiveFormat, ArchiveWriter, ByteStream, ZipArchiveWriter, ZipFormat};
pub use channel::{drive, Channel, ChannelClosed, ChannelId, Outbound};
pub use error::RelayError;
pub use paths::{validate_entry_name, ConfinedRoot, EntryNameError, PathError};
pub use registry::ProxyRegistry;
pub use relay::{FetchRelay, RelayedEntry};
pub use rpc::{CallError, RpcPeer};
pub use session::{ArchiveId, ArchiveInfo, ArchiveSessionStore};
pub use tickets::{TicketBook, TicketError, TicketStatus, UploadTicket};
