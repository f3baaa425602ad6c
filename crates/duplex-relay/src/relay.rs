//! Relay pair: the duplex forwarding session between two connections

use crate::config::RelayConfig;
use crate::connection::Connection;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::ErrorKind;
use crate::pair::{Ending, PairControl};
use crate::pump;
use crate::side::Side;
use crate::state::RelayState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(Uuid);

impl PairId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PairId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Counters for one direction of a pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    /// Bytes written to the destination
    pub bytes: u64,
    /// Chunks written to the destination
    pub chunks: u64,
    /// Bytes dropped because the destination was closed
    pub discarded_bytes: u64,
    pub discarded_chunks: u64,
}

/// How a relay pair ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both sides closed gracefully
    Closed,
    /// A pair-fatal error on `side` closed both sides
    Failed { side: Side, kind: ErrorKind },
    /// The drain timeout expired and both sides were force-closed
    ForceClosed,
}

/// Final report of a finished pair
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub pair_id: PairId,
    pub outcome: RelayOutcome,
    pub a_to_b: DirectionStats,
    pub b_to_a: DirectionStats,
    pub duration: Duration,
}

/// Two connections relayed into each other
///
/// Owning both connections by value guarantees that no other pair can
/// relay either of them.
pub struct RelayPair<A, B> {
    side_a: A,
    side_b: B,
    config: RelayConfig,
    id: PairId,
    sink: Arc<dyn DiagnosticSink>,
}

impl<A, B> RelayPair<A, B>
where
    A: Connection,
    B: Connection,
{
    /// Pair two already open connections
    pub fn new(side_a: A, side_b: B, config: RelayConfig) -> Self {
        Self {
            side_a,
            side_b,
            config: config.normalized(),
            id: PairId::new(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_defaults(side_a: A, side_b: B) -> Self {
        Self::new(side_a, side_b, RelayConfig::default())
    }

    /// Use a caller-chosen identifier instead of a random one
    pub fn with_id(mut self, id: PairId) -> Self {
        self.id = id;
        self
    }

    /// Report pair-fatal errors to `sink` instead of the tracing log
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn id(&self) -> PairId {
        self.id
    }

    fn control(&self) -> Arc<PairControl> {
        Arc::new(PairControl::new(
            self.id,
            self.config.close_mode,
            self.sink.clone(),
        ))
    }

    /// Relay until both sides are closed, then report
    pub async fn run(self) -> RelayReport {
        let control = self.control();
        self.run_with(control).await
    }

    /// Run the pair on its own task
    pub fn spawn(self) -> RelayHandle {
        let control = self.control();
        let task = tokio::spawn(self.run_with(control.clone()));
        RelayHandle { control, task }
    }

    async fn run_with(self, control: Arc<PairControl>) -> RelayReport {
        let started = Instant::now();
        let RelayPair {
            side_a,
            side_b,
            config,
            id,
            ..
        } = self;

        debug!(
            pair_id = %id,
            side_a = %side_a.describe(),
            side_b = %side_b.describe(),
            close_mode = ?config.close_mode,
            "Relay pair starting"
        );

        let (a_reader, a_writer) = side_a.split();
        let (b_reader, b_writer) = side_b.split();
        let (a_to_b_tx, a_to_b_rx) = mpsc::channel(config.queue_depth);
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel(config.queue_depth);

        let pumps = async {
            tokio::join!(
                pump::read_side(&control, Side::A, a_reader, a_to_b_tx, config.read_size),
                pump::write_side(&control, Side::B, b_writer, a_to_b_rx, config.probe_on_start),
                pump::read_side(&control, Side::B, b_reader, b_to_a_tx, config.read_size),
                pump::write_side(&control, Side::A, a_writer, b_to_a_rx, config.probe_on_start),
            )
        };

        let drain_timeout = config.drain_timeout;
        let watchdog = async {
            if let Some(timeout) = drain_timeout {
                control.drain_token().cancelled().await;
                tokio::time::sleep(timeout).await;
                control.force_close(timeout);
            }
            // Never completes; the pumps finishing ends the select below
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = pumps => {}
            _ = watchdog => {}
        }

        let outcome = match control.ending() {
            Ending::Closed => RelayOutcome::Closed,
            Ending::Failed(side, kind) => RelayOutcome::Failed { side, kind },
            Ending::Forced => RelayOutcome::ForceClosed,
        };

        let report = RelayReport {
            pair_id: id,
            outcome,
            a_to_b: control.stats(Side::A),
            b_to_a: control.stats(Side::B),
            duration: started.elapsed(),
        };

        info!(
            pair_id = %id,
            outcome = ?report.outcome,
            bytes_a_to_b = report.a_to_b.bytes,
            bytes_b_to_a = report.b_to_a.bytes,
            discarded_bytes = report.a_to_b.discarded_bytes + report.b_to_a.discarded_bytes,
            duration_ms = report.duration.as_millis() as u64,
            "Relay pair finished"
        );

        report
    }
}

/// Control surface of a spawned relay pair
///
/// Dropping the handle leaves the pair running.
pub struct RelayHandle {
    control: Arc<PairControl>,
    task: JoinHandle<RelayReport>,
}

impl RelayHandle {
    pub fn id(&self) -> PairId {
        self.control.id()
    }

    pub fn state(&self) -> RelayState {
        self.control.state()
    }

    /// Live counters as `(a_to_b, b_to_a)`
    pub fn stats(&self) -> (DirectionStats, DirectionStats) {
        (self.control.stats(Side::A), self.control.stats(Side::B))
    }

    /// Close one side as if it had reached end-of-stream
    ///
    /// The other side still receives everything already queued for it
    /// before its graceful close.
    pub fn close_side(&self, side: Side) {
        self.control.request_close(side);
    }

    /// Gracefully close both sides
    pub fn close(&self) {
        self.control.request_close(Side::A);
        self.control.request_close(Side::B);
    }

    /// Close both sides immediately, dropping anything not yet delivered
    ///
    /// The pair finishes with `RelayOutcome::ForceClosed`, unless it already
    /// failed.
    pub fn abort(&self) {
        self.control.abort_now();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pair to finish
    pub async fn join(self) -> Result<RelayReport, JoinError> {
        self.task.await
    }

    /// Wait for the pair to finish until `deadline`, then abort it
    pub async fn join_until(self, deadline: Instant) -> Result<RelayReport, JoinError> {
        let RelayHandle { control, mut task } = self;
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                control.abort_now();
                task.await
            }
        }
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_id_display_is_uuid() {
        let uuid = Uuid::new_v4();
        let id = PairId::from_uuid(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), &uuid);
    }

    #[test]
    fn test_pair_ids_are_unique() {
        assert_ne!(PairId::new(), PairId::new());
    }
}
