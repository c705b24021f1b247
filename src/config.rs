use std::time::Duration;

use anyhow::bail;

use crate::segment::HEADER_LEN;

/// Tunables for both transfer roles. All window-like quantities are counted in
///  segments, durations are wall-clock.
#[derive(Debug, Clone)]
pub struct RuftConfig {
    /// Maximum payload bytes carried by a single DATA segment. The implied
    ///  datagram size is this plus the fixed header; it must fit whatever path
    ///  the datagrams actually take, and both ends of a deployment must agree
    ///  on it. The default keeps datagrams at 1024 bytes.
    pub max_segment_payload: usize,

    /// Capacity of the receiver's reorder buffer, in segments. The advertised
    ///  flow-control window is derived from the unused part of this buffer.
    pub receive_window: u16,

    /// Hard upper bound on the congestion window, in segments.
    pub max_window: u32,

    /// Initial slow-start threshold, in segments.
    pub initial_ssthresh: u32,

    /// Number of duplicate ACKs that triggers a fast retransmission of the
    ///  oldest outstanding segment.
    pub dup_ack_threshold: u32,

    /// Maximum number of retransmissions for any one segment (SYN, DATA or
    ///  FIN) before the transfer is aborted as failed.
    pub max_retries: u32,

    /// Retransmission timeout used before the first round-trip sample is
    ///  available.
    pub initial_rto: Duration,

    /// Lower clamp for the adaptive retransmission timeout.
    pub min_rto: Duration,

    /// Upper clamp for the adaptive retransmission timeout. Also caps the
    ///  exponential backoff applied to repeatedly retransmitted segments.
    pub max_rto: Duration,

    /// How long the connecting side waits for a SYN+ACK per handshake attempt.
    pub handshake_timeout: Duration,

    /// How long the receiver tolerates total silence mid-transfer before it
    ///  gives up on the peer.
    pub idle_timeout: Duration,

    /// How long the receiver stays around after acknowledging the FIN,
    ///  re-acknowledging duplicate FINs in case its FIN+ACK was lost.
    pub fin_linger: Duration,

    /// Optional wall-clock budget for the whole transfer on the sending side.
    pub overall_deadline: Option<Duration>,
}

impl RuftConfig {
    pub fn new() -> RuftConfig {
        RuftConfig {
            max_segment_payload: 1024 - HEADER_LEN,
            receive_window: 64,
            max_window: 128,
            initial_ssthresh: 64,
            dup_ack_threshold: 3,
            max_retries: 10,
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            fin_linger: Duration::from_secs(2),
            overall_deadline: None,
        }
    }

    /// The datagram size implied by the configured segment payload, i.e. the
    ///  buffer size needed to receive any well-formed segment.
    pub fn max_datagram_size(&self) -> usize {
        self.max_segment_payload + HEADER_LEN
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_segment_payload == 0 {
            bail!("segment payload size must be positive");
        }
        if self.max_segment_payload > u16::MAX as usize {
            bail!("segment payload size does not fit the wire format's length field");
        }
        if self.receive_window == 0 {
            bail!("receive window must be at least one segment");
        }
        if self.max_window == 0 {
            bail!("maximum window must be at least one segment");
        }
        if self.initial_ssthresh == 0 {
            bail!("initial slow-start threshold must be at least one segment");
        }
        if self.dup_ack_threshold == 0 {
            bail!("duplicate ACK threshold must be positive");
        }
        if self.max_retries == 0 {
            bail!("retry budget must allow at least one retransmission");
        }
        if self.min_rto > self.max_rto {
            bail!("minimum retransmission timeout exceeds the maximum");
        }
        if self.initial_rto < self.min_rto || self.initial_rto > self.max_rto {
            bail!("initial retransmission timeout is outside the clamp range");
        }
        Ok(())
    }
}

impl Default for RuftConfig {
    fn default() -> Self {
        RuftConfig::new()
    }
}
