//! AIMD congestion control: slow start with exponential growth up to the
//! slow-start threshold, additive increase past it, multiplicative decrease
//! and full collapse on loss.
//!
//! The additive increase of `1/cwnd` per acknowledgment is kept in integer
//! arithmetic: a counter accumulates acknowledgments and rolls over into one
//! extra segment of window once it reaches `cwnd`. Rounding is therefore
//! floor, the fractional remainder stays in the counter, and growth is
//! deterministic for tests.

use std::cmp::{max, min};

use tracing::debug;

use crate::config::RuftConfig;

/// Growth regime. Derived from `cwnd < ssthresh` rather than stored, which
///  settles the boundary after a loss collapses ssthresh to 1: the window is
///  already at the threshold, so growth continues linearly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionPhase {
    SlowStart,
    CongestionAvoidance,
}

#[derive(Debug)]
pub struct CongestionControl {
    cwnd: u32,
    /// accumulated fractional additive increase, always < cwnd
    cwnd_cnt: u32,
    ssthresh: u32,
    max_window: u32,
}

impl CongestionControl {
    pub fn new(config: &RuftConfig) -> CongestionControl {
        CongestionControl {
            cwnd: 1,
            cwnd_cnt: 0,
            ssthresh: config.initial_ssthresh,
            max_window: config.max_window,
        }
    }

    #[cfg(test)]
    pub fn set_internals(&mut self, cwnd: u32, cwnd_cnt: u32, ssthresh: u32) {
        self.cwnd = cwnd;
        self.cwnd_cnt = cwnd_cnt;
        self.ssthresh = ssthresh;
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn phase(&self) -> CongestionPhase {
        if self.cwnd < self.ssthresh {
            CongestionPhase::SlowStart
        } else {
            CongestionPhase::CongestionAvoidance
        }
    }

    /// Credits one acknowledgment event. A cumulative ACK confirming several
    ///  segments still counts as a single event - the peer sent one ACK, and
    ///  crediting each covered segment would overfeed the window whenever the
    ///  receiver coalesces.
    pub fn on_ack(&mut self) {
        if self.cwnd == self.max_window {
            // saturated, nothing to grow
            return;
        }

        match self.phase() {
            CongestionPhase::SlowStart => {
                self.cwnd += 1;
            }
            CongestionPhase::CongestionAvoidance => {
                self.cwnd_cnt += 1;
                while self.cwnd_cnt >= self.cwnd {
                    self.cwnd_cnt -= self.cwnd;
                    self.cwnd += 1;
                }
            }
        }

        self.cwnd = min(self.cwnd, self.max_window);
        debug!("adjusted cwnd to {} segments", self.cwnd);
    }

    /// Collapses the window after a loss event, whether signalled by a
    ///  retransmission timeout or by the duplicate-ACK threshold: the
    ///  threshold drops to half the current window and growth restarts from a
    ///  single segment.
    pub fn on_loss(&mut self) {
        self.ssthresh = max(self.cwnd / 2, 1);
        self.cwnd = 1;
        // without this reset the accumulated counter could bump cwnd right back up
        self.cwnd_cnt = 0;

        debug!("loss -> ssthresh {}, cwnd back to 1 segment", self.ssthresh);
    }
}
