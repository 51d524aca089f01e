//! Tracking of in-flight asynchronous rule runs.
//!
//! Every run takes a sequence number when it starts. A wait snapshots the
//! next sequence number and resolves once no run below that horizon is still
//! in flight, so runs scheduled after the wait began are not waited for.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TrellisError};

#[derive(Debug, Default)]
struct PendingState {
    next: u64,
    in_flight: BTreeSet<u64>,
}

/// In-flight run registry for one entity.
#[derive(Debug)]
pub struct PendingTracker {
    state: Mutex<PendingState>,
    version: watch::Sender<u64>,
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTracker {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(PendingState::default()),
            version,
        }
    }

    /// Register a run. Returns its sequence number.
    pub fn begin(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next;
        state.next += 1;
        state.in_flight.insert(seq);
        seq
    }

    /// Mark a run complete and wake waiters.
    pub fn finish(&self, seq: u64) {
        let removed = self.state.lock().in_flight.remove(&seq);
        if removed {
            self.version.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Current horizon: every run started so far has a lower sequence number.
    pub fn horizon(&self) -> u64 {
        self.state.lock().next
    }

    fn settled_below(&self, horizon: u64) -> bool {
        self.state.lock().in_flight.range(..horizon).next().is_none()
    }

    /// Wait for every run started before this call.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let horizon = self.horizon();
        self.wait_until(horizon, cancel).await
    }

    /// Wait for every run with a sequence number below `horizon`.
    pub async fn wait_until(&self, horizon: u64, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.version.subscribe();
        loop {
            if self.settled_below(horizon) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TrellisError::cancelled("wait_for_pending"));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
