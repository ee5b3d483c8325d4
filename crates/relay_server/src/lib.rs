// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP front end of the relay: archive management, delegate channels and upload ingestion.

pub mod api;
mod opts;
pub mod server;
pub mod state;
mod websocket;

pub use opts::{Config, Opts};
pub use server::run_server;
