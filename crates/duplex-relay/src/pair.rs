//! Shared control block of one relay pair
//!
//! The four pump futures of a pair report their events here. A single mutex
//! guards the state machine, which is never held across an await point.
//! Cancellation tokens carry the resulting decisions back to the pumps.

use crate::config::CloseMode;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{ErrorKind, RelayError};
use crate::relay::{DirectionStats, PairId};
use crate::side::Side;
use crate::state::RelayState;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Byte counters for one direction, keyed by source side
#[derive(Debug, Default)]
struct DirectionCounters {
    bytes: AtomicU64,
    chunks: AtomicU64,
    discarded_bytes: AtomicU64,
    discarded_chunks: AtomicU64,
}

impl DirectionCounters {
    fn snapshot(&self) -> DirectionStats {
        DirectionStats {
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            discarded_chunks: self.discarded_chunks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: RelayState,
    /// Whether new chunks may still be queued towards each side
    accepting: [bool; 2],
    /// Whether each side has stopped, or been asked to stop, being read
    read_ending: [bool; 2],
    failure: Option<(Side, ErrorKind)>,
    forced: bool,
}

/// How a pair ended, as seen by the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ending {
    Closed,
    Failed(Side, ErrorKind),
    Forced,
}

pub(crate) struct PairControl {
    id: PairId,
    close_mode: CloseMode,
    inner: Mutex<Inner>,
    sink: Arc<dyn DiagnosticSink>,
    /// Force-close everything, no flushing
    abort: CancellationToken,
    /// Stop reading a side (collaborator close, or full-close completion)
    stop_read: [CancellationToken; 2],
    /// Stop accepting chunks for a side and drain its queue
    close_write: [CancellationToken; 2],
    /// Starts the drain timeout once no side is left reading new data
    drain: CancellationToken,
    counters: [DirectionCounters; 2],
}

impl PairControl {
    pub(crate) fn new(id: PairId, close_mode: CloseMode, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            id,
            close_mode,
            inner: Mutex::new(Inner {
                state: RelayState::Active,
                accepting: [true, true],
                read_ending: [false, false],
                failure: None,
                forced: false,
            }),
            sink,
            abort: CancellationToken::new(),
            stop_read: [CancellationToken::new(), CancellationToken::new()],
            close_write: [CancellationToken::new(), CancellationToken::new()],
            drain: CancellationToken::new(),
            counters: [DirectionCounters::default(), DirectionCounters::default()],
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner is only mutated whole under the lock, so a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> PairId {
        self.id
    }

    pub(crate) fn state(&self) -> RelayState {
        self.lock().state
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub(crate) fn stop_read_token(&self, side: Side) -> &CancellationToken {
        &self.stop_read[side.index()]
    }

    pub(crate) fn close_write_token(&self, side: Side) -> &CancellationToken {
        &self.close_write[side.index()]
    }

    pub(crate) fn drain_token(&self) -> &CancellationToken {
        &self.drain
    }

    /// Record that `side` stops being read; returns whether draining starts
    ///
    /// A full close ends the whole pair, so the first side is enough. With
    /// half-close the other direction may still be carrying data until its
    /// own reader ends.
    fn mark_read_ending(&self, inner: &mut Inner, side: Side) -> bool {
        inner.read_ending[side.index()] = true;
        match self.close_mode {
            CloseMode::Full => true,
            CloseMode::HalfClose => inner.read_ending.iter().all(|ending| *ending),
        }
    }

    /// Whether a chunk may be queued towards `to`
    pub(crate) fn accepts(&self, to: Side) -> bool {
        let inner = self.lock();
        !inner.state.is_terminated() && inner.accepting[to.index()]
    }

    /// The collaborator asked for `side` to be closed gracefully
    pub(crate) fn request_close(&self, side: Side) {
        debug!(pair_id = %self.id, side = %side, "Close requested");
        let drain = {
            let mut inner = self.lock();
            self.mark_read_ending(&mut inner, side)
        };
        self.stop_read[side.index()].cancel();
        // The reader may be stuck handing over a chunk and not report the
        // close itself, so the timeout has to start here
        if drain {
            self.drain.cancel();
        }
    }

    /// `side` reached end-of-stream, or stopped being read
    pub(crate) fn side_closed(&self, side: Side) {
        let (next, drain) = {
            let mut inner = self.lock();
            let Some(next) = inner.state.on_closed(side) else {
                return;
            };
            inner.state = next;
            // The closed side was the only source of data for its peer
            inner.accepting[side.peer().index()] = false;
            if self.close_mode == CloseMode::Full {
                inner.accepting[side.index()] = false;
            }
            (next, self.mark_read_ending(&mut inner, side))
        };

        debug!(pair_id = %self.id, side = %side, state = %next, "Side closed");

        if self.close_mode == CloseMode::Full {
            self.close_write[side.index()].cancel();
        }
        if drain {
            self.drain.cancel();
        }
    }

    /// The write path towards `side` was flushed and shut down
    pub(crate) fn write_closed(&self, side: Side) {
        trace!(pair_id = %self.id, side = %side, "Write side shut down");
        if self.close_mode == CloseMode::Full {
            // Graceful close of this side is complete; stop reading it too
            self.stop_read[side.index()].cancel();
        }
    }

    /// A pair-fatal error occurred; terminate and close everything
    pub(crate) fn fail(&self, err: RelayError) {
        {
            let mut inner = self.lock();
            if inner.state.on_error().is_none() {
                debug!(
                    pair_id = %self.id,
                    side = %err.side(),
                    "Ignoring error after termination: {}",
                    err
                );
                return;
            }
            inner.state = RelayState::Terminated;
            inner.accepting = [false, false];
            inner.failure = Some((err.side(), err.kind()));
        }

        self.sink.record(Diagnostic::from_error(self.id, &err));
        self.abort.cancel();
    }

    /// Drain timeout expired while the pumps were still running
    ///
    /// Applies even after a graceful termination, since a writer may still
    /// be stuck flushing to an unresponsive side.
    pub(crate) fn force_close(&self, after: Duration) {
        if self.force() {
            warn!(
                pair_id = %self.id,
                "Pair did not finish closing within {:?}, forcing close",
                after
            );
        }
    }

    /// Close both sides immediately on the collaborator's request
    pub(crate) fn abort_now(&self) {
        if self.force() {
            warn!(pair_id = %self.id, "Aborting pair");
        }
    }

    /// Returns false if the pair was already aborted
    fn force(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.failure.is_some() || self.abort.is_cancelled() {
                return false;
            }
            inner.state = RelayState::Terminated;
            inner.accepting = [false, false];
            inner.forced = true;
        }
        self.abort.cancel();
        true
    }

    /// Drop a chunk that can no longer be delivered
    pub(crate) fn discard(&self, from: Side, chunk: Bytes) {
        let counters = &self.counters[from.index()];
        counters
            .discarded_bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        counters.discarded_chunks.fetch_add(1, Ordering::Relaxed);
        trace!(
            pair_id = %self.id,
            from = %from,
            len = chunk.len(),
            "Discarding chunk, destination closed"
        );
        drop(chunk);
    }

    pub(crate) fn record_forwarded(&self, from: Side, len: usize) {
        let counters = &self.counters[from.index()];
        counters.bytes.fetch_add(len as u64, Ordering::Relaxed);
        counters.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters for the direction carrying data out of `from`
    pub(crate) fn stats(&self, from: Side) -> DirectionStats {
        self.counters[from.index()].snapshot()
    }

    pub(crate) fn ending(&self) -> Ending {
        let inner = self.lock();
        match (inner.failure, inner.forced) {
            (Some((side, kind)), _) => Ending::Failed(side, kind),
            (None, true) => Ending::Forced,
            (None, false) => Ending::Closed,
        }
    }
}
