//! Per-direction forwarding
//!
//! A direction is a reader future on the source side and a writer future on
//! the destination side, joined by a bounded queue. The queue is the only
//! buffering: once it is full the reader stops pulling from the source until
//! the writer catches up.

use crate::connection::{ChunkReader, ChunkWriter};
use crate::error::RelayError;
use crate::pair::PairControl;
use crate::side::Side;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

/// Read chunks from `from` and queue them towards its peer
pub(crate) async fn read_side<R: ChunkReader>(
    control: &PairControl,
    from: Side,
    mut reader: R,
    queue: mpsc::Sender<Bytes>,
    read_size: usize,
) {
    let to = from.peer();
    let abort = control.abort_token();
    let stop = control.stop_read_token(from);

    loop {
        let read = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            _ = stop.cancelled() => break,
            read = reader.read_chunk(read_size) => read,
        };

        let chunk = match read {
            Ok(Some(chunk)) if chunk.is_empty() => continue,
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                trace!(pair_id = %control.id(), side = %from, "EOF");
                break;
            }
            Err(e) => {
                control.fail(RelayError::Read {
                    side: from,
                    source: e,
                });
                return;
            }
        };

        if !control.accepts(to) {
            control.discard(from, chunk);
            continue;
        }

        // A chunk already read is delivered even if a close is requested
        // meanwhile; only an abort gives up on it
        let sent = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            sent = queue.send(chunk) => sent,
        };
        if let Err(mpsc::error::SendError(chunk)) = sent {
            // Writer already stopped draining this direction
            control.discard(from, chunk);
        }
    }

    // Update state before the queue closes, so the writer's shutdown is
    // attributed to this side's close
    control.side_closed(from);
    drop(queue);
}

/// Write queued chunks to `to`, then shut its write direction down
pub(crate) async fn write_side<W: ChunkWriter>(
    control: &PairControl,
    to: Side,
    mut writer: W,
    mut queue: mpsc::Receiver<Bytes>,
    probe: bool,
) {
    let from = to.peer();
    let abort = control.abort_token();
    let close = control.close_write_token(to);

    if probe {
        let flushed = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            flushed = writer.flush() => Some(flushed),
        };
        match flushed {
            None => {
                writer.abort();
                return;
            }
            Some(Err(e)) => {
                control.fail(RelayError::Write { side: to, source: e });
                writer.abort();
                return;
            }
            Some(Ok(())) => {}
        }
    }

    let mut closing = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                writer.abort();
                return;
            }
            _ = close.cancelled(), if !closing => {
                // Refuse new chunks but deliver the ones already queued
                queue.close();
                closing = true;
                continue;
            }
            next = queue.recv() => next,
        };

        let Some(chunk) = next else {
            break;
        };

        let len = chunk.len();
        let written = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            written = writer.write_chunk(chunk) => Some(written),
        };
        match written {
            None => {
                writer.abort();
                return;
            }
            Some(Err(e)) => {
                control.fail(RelayError::Write { side: to, source: e });
                writer.abort();
                return;
            }
            Some(Ok(())) => control.record_forwarded(from, len),
        }
    }

    let shut = tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        shut = writer.shutdown() => Some(shut),
    };
    match shut {
        None => writer.abort(),
        Some(Err(e)) => {
            control.fail(RelayError::Write { side: to, source: e });
            writer.abort();
        }
        Some(Ok(())) => control.write_closed(to),
    }
}
