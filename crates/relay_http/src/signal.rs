// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process signals that ask a server to stop
//!
//! Installing [`ShutdownSignals`] replaces the default handlers for the process, for good.
//! Signals arriving close together may be reported once.

use std::io;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// How urgently the process was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// First `SIGINT`: stop accepting work and let what's running finish.
    Graceful,
    /// A repeated `SIGINT`, or `SIGTERM`: stop now.
    Fast,
}

pub struct ShutdownSignals {
    interrupted: bool,
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl ShutdownSignals {
    /// Start listening. Signals sent before this are not seen.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupted: false,
            #[cfg(unix)]
            interrupt: signal(SignalKind::interrupt())?,
            #[cfg(unix)]
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown request.
    pub async fn next(&mut self) -> io::Result<Shutdown> {
        #[cfg(unix)]
        tokio::select! {
            received = self.interrupt.recv() => if received.is_none() {
                return Err(io::Error::other("signal stream closed"));
            },
            _ = self.terminate.recv() => return Ok(Shutdown::Fast),
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        Ok(match std::mem::replace(&mut self.interrupted, true) {
            false => Shutdown::Graceful,
            true => Shutdown::Fast,
        })
    }
}
