// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background tasks owned by whoever spawned them

use std::future::Future;

use tokio::task::JoinSet;
use tracing::error;

/// A set of spawned tasks that can't outlive its owner.
///
/// [`finish`](Nursery::finish) waits for every task; dropping the nursery aborts whatever is
/// still running. Aborted tasks are dropped at their next suspension point, so anything they
/// hold (locks, half-written entries) is released soon after, not immediately.
#[derive(Default)]
pub struct Nursery {
    children: JoinSet<()>,
}

impl Nursery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` on the runtime as a child of this nursery.
    pub fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        // forget children that already finished, or a long-lived nursery grows without bound
        while let Some(finished) = self.children.try_join_next() {
            report(finished);
        }
        self.children.spawn(task);
    }

    /// Wait for every child to finish.
    ///
    /// Dropping the returned future aborts the children that are left.
    pub async fn finish(mut self) {
        while let Some(finished) = self.children.join_next().await {
            report(finished);
        }
    }
}

fn report(finished: Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            error!("Child task panicked: {err}");
        }
    }
}
