//! Engine maintenance loops.
//!
//! The engine runs exactly two background jobs: draining the frozen
//! memtable into an SST, and folding the SST set back down once it passes
//! the compaction threshold. Each is a long-lived tokio task that sleeps
//! for its configured period, runs one pass, and exits when the engine
//! closes. A failed pass means acknowledged writes may no longer be
//! durable, so it aborts the process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::{compaction, flush, Shared};

/// Handle to the flush and compaction loops.
pub(crate) struct Maintenance {
    stop: watch::Sender<bool>,
    flush: JoinHandle<()>,
    compaction: JoinHandle<()>,
}

impl Maintenance {
    /// Spawns both loops against the shared engine state.
    pub fn start(shared: &Arc<Shared>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let flush = {
            let shared = Arc::clone(shared);
            run_every(
                "memtable-flush",
                shared.opts.flush_interval,
                stop_rx.clone(),
                move || flush::flush_frozen_memtable(&shared).map(|_| ()),
            )
        };
        let compaction = {
            let shared = Arc::clone(shared);
            run_every(
                "compaction",
                shared.opts.compaction_interval,
                stop_rx,
                move || compaction::maybe_compact(&shared),
            )
        };
        Self {
            stop,
            flush,
            compaction,
        }
    }

    /// Signals both loops to stop and waits for any in-flight pass to
    /// finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        for handle in [self.flush, self.compaction] {
            handle
                .await
                .map_err(|e| Error::Io(format!("maintenance task join error: {e}")))?;
        }
        Ok(())
    }
}

fn run_every(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut pass: impl FnMut() -> Result<()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stopped = tokio::select! {
                _ = tokio::time::sleep(period) => *stop.borrow(),
                changed = stop.changed() => changed.is_err() || *stop.borrow(),
            };
            if stopped {
                tracing::info!(task = name, "maintenance loop stopped");
                return;
            }
            if let Err(e) = pass() {
                tracing::error!(task = name, error = %e, "maintenance pass failed, aborting");
                std::process::abort();
            }
        }
    })
}
