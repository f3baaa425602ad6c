//! Duplex byte relay
//!
//! Pairs two already-established byte-stream connections and forwards bytes
//! between them until both sides are done, propagating close and failure
//! from one side to the other.
//!
//! # Architecture
//!
//! ```text
//!   side A                    RelayPair                      side B
//! ┌────────┐  read   ┌───────────────────────────┐  write  ┌────────┐
//! │        │────────▶│ reader A ─[queue]─▶ writer B │───────▶│        │
//! │        │◀────────│ writer A ◀─[queue]─ reader B │◀───────│        │
//! └────────┘  write  └───────────────────────────┘  read   └────────┘
//!                              │
//!                       PairControl (state machine,
//!                       close/abort signals, counters)
//! ```
//!
//! Each direction has a bounded queue, so a slow destination stops the
//! reader of its source instead of growing memory.

pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
mod pair;
mod pump;
pub mod relay;
pub mod side;
pub mod state;
pub mod tcp;
pub mod tracker;


pub use config::{CloseMode, RelayConfig, RelayConfigError};
pub use connection::{ChunkReader, ChunkWriter, Connection, IoReader, IoWriter, StreamConnection};
pub use diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
pub use error::{ErrorKind, RelayError, RelayResult};
pub use relay::{DirectionStats, PairId, RelayHandle, RelayOutcome, RelayPair, RelayReport};
pub use side::Side;
pub use state::RelayState;
pub use tcp::TcpWriter;
pub use tracker::RelayTracker;
