// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal HTTP tooling shared by the relay server and its tests

pub mod body;
pub mod cors;
pub mod nursery;
pub mod response;
pub mod server;
pub mod signal;

pub use server::Server;
