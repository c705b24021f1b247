//! End-of-run counters for both transfer roles.

use std::time::Duration;

/// What the sending side counted over one transfer. Byte and segment counts
///  cover first transmissions only, retransmissions are tracked separately so
///  the loss behavior of a run stays visible.
#[derive(Debug, Clone, Default)]
pub struct SendStats {
    pub bytes_sent: u64,
    pub segments_sent: u64,
    pub retransmissions: u64,
    pub duplicate_acks: u64,
    pub elapsed: Duration,
}

impl SendStats {
    pub fn throughput_kib_per_sec(&self) -> f64 {
        throughput_kib_per_sec(self.bytes_sent, self.elapsed)
    }
}

/// What the receiving side counted over one transfer.
#[derive(Debug, Clone, Default)]
pub struct ReceiveStats {
    pub bytes_delivered: u64,
    pub segments_delivered: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub elapsed: Duration,
}

impl ReceiveStats {
    pub fn throughput_kib_per_sec(&self) -> f64 {
        throughput_kib_per_sec(self.bytes_delivered, self.elapsed)
    }
}

fn throughput_kib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    bytes as f64 / 1024.0 / elapsed.as_secs_f64()
}
