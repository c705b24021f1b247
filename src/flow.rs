//! Receiver-imposed flow control, sender side.

use std::cmp::min;

/// Tracks the peer's most recently advertised receive window and combines it
///  with the congestion window into the effective transmission bound.
#[derive(Debug)]
pub struct FlowControl {
    peer_window: u16,
}

impl FlowControl {
    /// Nothing is known about the peer's buffer before the handshake, so the
    ///  bound starts at a single segment.
    pub fn new() -> FlowControl {
        FlowControl { peer_window: 1 }
    }

    /// Records the window advertised on an ACK-bearing segment.
    pub fn on_window_advertisement(&mut self, window: u16) {
        self.peer_window = window;
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    /// How many segments may be outstanding right now: the congestion window
    ///  or the peer's advertisement, whichever is smaller. Never less than
    ///  one - the receiver always absorbs or re-acknowledges the base
    ///  segment, and a zero bound would stall the transfer with no probe
    ///  mechanism to reopen it.
    pub fn effective_window(&self, cwnd: u32) -> u32 {
        min(cwnd, self.peer_window as u32).max(1)
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        FlowControl::new()
    }
}
