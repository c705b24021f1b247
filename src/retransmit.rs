//! Retransmission timing for the sender window.
//!
//! Conceptually every outstanding segment has its own deadline, but cumulative
//! ACKs always clear the window from the front, so a single timer armed for
//! the oldest unacknowledged segment is enough: acknowledging it implicitly
//! covers everything older, and the timer is rearmed for the new oldest
//! segment afterwards.

use std::time::Duration;

use tokio::time::Instant;

pub struct RetransmitTimer {
    armed: Option<(u32, Instant)>,
}

impl RetransmitTimer {
    pub fn new() -> RetransmitTimer {
        RetransmitTimer { armed: None }
    }

    /// Arms the timer for `seq`, replacing whatever it was armed for before.
    pub fn start(&mut self, seq: u32, deadline: Instant) {
        self.armed = Some((seq, deadline));
    }

    /// Disarms the timer if it is currently armed for `seq`.
    pub fn cancel(&mut self, seq: u32) {
        if let Some((armed_seq, _)) = self.armed {
            if armed_seq == seq {
                self.armed = None;
            }
        }
    }

    /// Disarms the timer unconditionally, for when the window drains empty.
    pub fn clear(&mut self) {
        self.armed = None;
    }

    /// Returns the segment whose deadline has passed, disarming the timer.
    ///  At most one expiry is reported per call; the caller retransmits and
    ///  rearms.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        match self.armed {
            Some((seq, deadline)) if now >= deadline => {
                self.armed = None;
                Some(seq)
            }
            _ => None,
        }
    }

    /// The armed deadline, bounding how long the control loop may wait for
    ///  incoming datagrams before the timer must be polled again.
    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|(_, deadline)| deadline)
    }
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        RetransmitTimer::new()
    }
}

/// Effective timeout for a segment that was already retransmitted `retries`
///  times: the current timeout doubled once per retry, capped at `max_rto` so
///  sustained loss backs off instead of hammering the channel.
pub fn backed_off(rto: Duration, retries: u32, max_rto: Duration) -> Duration {
    rto.saturating_mul(2u32.saturating_pow(retries)).min(max_rto)
}
