// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The delegate side of the relay.
//!
//! A delegate runs where a remote origin's credentials are available. It keeps a channel open
//! to the relay server, fetches whatever the server asks for from that origin, and uploads the
//! bodies back to the server.

pub mod error;
pub mod executor;
mod opts;
pub mod session;
pub mod transport;

pub use error::{DelegateError, RelayFailure, TransportError};
pub use executor::RelayExecutor;
pub use opts::Opts;
pub use session::{discover, DelegateSession};
pub use transport::{FetchedBody, RelayTransport, ReqwestTransport, UploadBody};
