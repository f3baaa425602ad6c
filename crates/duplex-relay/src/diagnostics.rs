//! Diagnostic sink for pair-fatal errors

use crate::error::{ErrorKind, RelayError};
use crate::relay::PairId;
use crate::side::Side;
use tracing::error;

/// One pair-fatal failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub pair_id: PairId,
    pub side: Side,
    pub kind: ErrorKind,
    pub io_kind: std::io::ErrorKind,
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn from_error(pair_id: PairId, err: &RelayError) -> Self {
        Self {
            pair_id,
            side: err.side(),
            kind: err.kind(),
            io_kind: err.io_kind(),
            message: err.to_string(),
        }
    }
}

/// Receives the error that terminated a pair
///
/// Called at most once per pair, from the relay's task. Implementations must
/// not block.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: Diagnostic);
}

impl<F> DiagnosticSink for F
where
    F: Fn(Diagnostic) + Send + Sync,
{
    fn record(&self, diagnostic: Diagnostic) {
        self(diagnostic)
    }
}

/// Default sink: emits an `error` event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, diagnostic: Diagnostic) {
        error!(
            pair_id = %diagnostic.pair_id,
            side = %diagnostic.side,
            kind = %diagnostic.kind,
            io_kind = ?diagnostic.io_kind,
            "Relay pair failed: {}",
            diagnostic.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_diagnostic_from_error() {
        let pair_id = PairId::new();
        let err = RelayError::Write {
            side: Side::B,
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };

        let diagnostic = Diagnostic::from_error(pair_id, &err);
        assert_eq!(diagnostic.pair_id, pair_id);
        assert_eq!(diagnostic.side, Side::B);
        assert_eq!(diagnostic.kind, ErrorKind::Write);
        assert_eq!(diagnostic.io_kind, io::ErrorKind::BrokenPipe);
        assert!(diagnostic.message.contains("side B"));
    }

    #[test]
    fn test_closure_sink() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let recorded = recorded.clone();
            move |d: Diagnostic| recorded.lock().unwrap().push(d)
        };

        let err = RelayError::Read {
            side: Side::A,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        sink.record(Diagnostic::from_error(PairId::new(), &err));

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].side, Side::A);
    }
}
