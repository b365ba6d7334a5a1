// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, warn};

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Owns the long running tasks. A task that fails or panics is logged and
/// the others keep running.
#[derive(Default)]
pub struct Supervisor {
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(async move {
            // inner spawn so a panic surfaces as a JoinError we can name
            let inner = tokio::spawn(task);
            let _abort = AbortOnDrop(inner.abort_handle());
            match inner.await {
                Ok(()) => debug!("SUPERVISOR | {name} stopped"),
                Err(e) if e.is_panic() => error!("SUPERVISOR | {name} panicked: {e:?}"),
                Err(e) => warn!("SUPERVISOR | {name} aborted: {e}"),
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every task, aborting what is still running after `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "SUPERVISOR | {} task(s) still running after {grace:?}, aborting",
                self.tasks.len()
            );
            self.tasks.shutdown().await;
        }
    }
}
