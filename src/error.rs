use std::io;
use std::time::Duration;

use thiserror::Error;

/// Fatal conditions that abort a transfer.
///
/// Transient trouble (a dropped, corrupted or reordered datagram) is absorbed
/// by the protocol's retransmission and duplicate-ACK machinery and never
/// shows up here; only retry exhaustion, elapsed deadlines and collaborator
/// failures terminate a run.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A segment went unacknowledged through the whole retry budget.
    #[error("segment {seq} still unacknowledged after {attempts} transmissions, giving up")]
    RetryExhausted { seq: u32, attempts: u32 },

    /// The underlying send/receive primitive failed.
    #[error("datagram channel unavailable: {0}")]
    ChannelUnavailable(#[source] io::Error),

    /// Reading payload from the input source failed.
    #[error("input source failed: {0}")]
    Source(#[source] io::Error),

    /// Writing delivered payload to the output sink failed.
    #[error("output sink failed: {0}")]
    Sink(#[source] io::Error),

    /// The overall deadline (sender) or idle timeout (receiver) elapsed.
    #[error("no progress within {0:?}, aborting the transfer")]
    DeadlineExceeded(Duration),
}
