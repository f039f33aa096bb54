//! The FIFO of pending response promises shared between the public API and
//! the connection's event-loop task.
//!
//! Modeled on `brocaar-redis-rs::aio`'s `PipelineSink::in_flight` queue: a
//! plain `VecDeque`, mutated only from the task that owns the socket, paired
//! one-for-one with replies as they arrive off the wire (RESP2 never batches
//! more than one reply per command, so this is simpler than `InFlight`'s
//! `response_count`/`buffer` accumulation).

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::frame::RespValue;
use crate::error::ConnectionError;
use crate::metrics::METRICS;

/// One outstanding request. `Quit` marks the synthetic `QUIT` frame written
/// during a graceful close — it has no caller-visible promise, but still
/// occupies its slot in the FIFO so its `+OK` reply is consumed in order.
pub enum PendingEntry {
    Caller(oneshot::Sender<Result<RespValue, ConnectionError>>),
    Quit,
}

#[derive(Default)]
pub struct Correlator {
    queue: VecDeque<(Instant, PendingEntry)>,
}

impl Correlator {
    pub fn push(&mut self, entry: PendingEntry) {
        self.queue.push_back((Instant::now(), entry));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Resolves the oldest pending entry with a reply decoded off the wire.
    /// Returns `true` if the resolved entry was the synthetic `QUIT` marker
    /// (the caller should treat this as "graceful shutdown may proceed").
    pub fn resolve_oldest(&mut self, value: RespValue) -> bool {
        let Some((submitted_at, entry)) = self.queue.pop_front() else {
            log::warn!("received a reply with no pending request to pair it with");
            return false;
        };

        METRICS.record_round_trip(submitted_at.elapsed().as_nanos() as u64);

        match entry {
            PendingEntry::Caller(tx) => {
                // A RESP `Error` reply still resolves the promise successfully —
                // it's an in-band value, not a transport failure.
                if value.is_error() {
                    METRICS.command_failed();
                } else {
                    METRICS.command_succeeded();
                }
                let _ = tx.send(Ok(value));
                false
            }
            PendingEntry::Quit => true,
        }
    }

    /// Fails every pending entry with `ConnectionClosed` — called when the
    /// transport closes (expectedly or not) while requests are outstanding.
    pub fn fail_all(&mut self) {
        for (_, entry) in self.queue.drain(..) {
            if let PendingEntry::Caller(tx) = entry {
                let _ = tx.send(Err(ConnectionError::ConnectionClosed));
            }
        }
    }
}
