//! Reliable file transfer over an unreliable datagram channel.
//!
//! This crate layers TCP-style delivery guarantees on top of UDP: byte-offset
//! sequencing, cumulative acknowledgments, receiver flow control and AIMD
//! congestion control, with retransmission driven by an adaptive timeout. The
//! sender and receiver are explicit state machines, each owned by a single
//! async control loop; the datagram socket, loss injection, and payload I/O
//! are collaborators behind trait seams.

pub mod channel;
pub mod config;
pub mod congestion;
pub mod error;
pub mod flow;
pub mod payload;
pub mod receiver;
pub mod retransmit;
pub mod rtt;
pub mod segment;
pub mod sender;
pub mod stats;
pub mod test_util;
