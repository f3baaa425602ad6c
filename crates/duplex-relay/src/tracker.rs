//! Tracking of live relay pairs
//!
//! Used by pairing collaborators to close every pair on shutdown and to
//! bound the number of concurrently relayed pairs.

use crate::relay::{PairId, RelayHandle, RelayOutcome, RelayReport};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Tracks spawned relay pairs by id
pub struct RelayTracker {
    pairs: Mutex<HashMap<PairId, RelayHandle>>,
}

impl RelayTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PairId, RelayHandle>> {
        self.pairs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pair
    ///
    /// If a pair with the same id is already tracked it is closed gracefully
    /// and replaced.
    pub fn register(&self, handle: RelayHandle) {
        let mut pairs = self.lock();
        if let Some(old) = pairs.insert(handle.id(), handle) {
            debug!(pair_id = %old.id(), "Replacing tracked pair, closing previous one");
            old.close();
        }
    }

    /// Gracefully close and stop tracking a pair
    pub fn close(&self, id: &PairId) -> bool {
        match self.lock().remove(id) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Gracefully close all tracked pairs; they stay tracked until they finish
    pub fn close_all(&self) {
        for handle in self.lock().values() {
            handle.close();
        }
    }

    /// Forget pairs that have finished; returns how many were removed
    pub fn prune(&self) -> usize {
        let mut pairs = self.lock();
        let before = pairs.len();
        pairs.retain(|_, handle| !handle.is_finished());
        before - pairs.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every pair and wait up to `timeout` for all of them to report
    ///
    /// Pairs still running at the deadline are aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<RelayReport> {
        let handles: Vec<RelayHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.close();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            let id = handle.id();
            match handle.join_until(deadline).await {
                Ok(report) => {
                    if report.outcome == RelayOutcome::ForceClosed {
                        warn!(pair_id = %id, "Relay pair did not finish within {:?}, aborted", timeout);
                    }
                    reports.push(report);
                }
                Err(e) => warn!(pair_id = %id, "Relay task failed: {}", e),
            }
        }
        reports
    }
}

impl Default for RelayTracker {
    fn default() -> Self {
        Self::new()
    }
}
