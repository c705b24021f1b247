//! Receiving role: accepts the connection, reorders arriving segments, emits
//!  cumulative ACKs and delivers payload to the sink strictly in sequence
//!  order.
//!
//! All state is owned by the single control loop; the only suspension point
//!  is the bounded-wait receive on the datagram channel.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::channel::DatagramChannel;
use crate::config::RuftConfig;
use crate::error::TransferError;
use crate::payload::PayloadSink;
use crate::segment::{Segment, SegmentFlags};
use crate::stats::ReceiveStats;

/// What the reorder buffer did with one arriving segment.
#[derive(Debug, PartialEq, Eq)]
pub enum Arrival {
    /// The segment was in sequence: these payloads (the segment's own plus
    ///  any contiguous run drained from the buffer) are ready for the sink.
    ///  `fin_reached` is set when the drained run ended with the
    ///  stream-ending segment.
    Delivered {
        chunks: Vec<Bytes>,
        fin_reached: bool,
    },
    /// Ahead of sequence, buffered until the gap before it fills.
    Held,
    /// At or below an already delivered sequence number, dropped (but still
    ///  acknowledged by the caller).
    Duplicate,
    /// So far ahead of the window span that only a misbehaving peer can have
    ///  sent it, dropped without buffering.
    Discarded,
}

struct HeldSegment {
    payload: Bytes,
    fin: bool,
}

/// Out-of-order arrivals pending in-order delivery.
///
/// `expected_seq` is the next byte offset the sink is waiting for; everything
///  ahead of it sits in `held` keyed by sequence number, so draining in key
///  order is draining in stream order.
pub struct ReceiveBuffer {
    expected_seq: u32,
    held: BTreeMap<u32, HeldSegment>,
    held_bytes: u64,
    capacity_segments: u16,
    max_segment_payload: usize,
}

impl ReceiveBuffer {
    pub fn new(initial_expected: u32, config: &RuftConfig) -> ReceiveBuffer {
        ReceiveBuffer {
            expected_seq: initial_expected,
            held: BTreeMap::new(),
            held_bytes: 0,
            capacity_segments: config.receive_window,
            max_segment_payload: config.max_segment_payload,
        }
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn held_segments(&self) -> usize {
        self.held.len()
    }

    /// The flow-control window to advertise, in segments: the unused part of
    ///  the buffer, floored to whole segments. Never less than one - the base
    ///  segment can always be absorbed (it either delivers and frees space or
    ///  overwrites a held duplicate), and a zero advertisement would stall
    ///  the sender for good.
    pub fn advertised_window(&self) -> u16 {
        let capacity_bytes = self.capacity_segments as u64 * self.max_segment_payload as u64;
        let free_bytes = capacity_bytes.saturating_sub(self.held_bytes);
        let window = free_bytes / self.max_segment_payload as u64;
        window.clamp(1, self.capacity_segments as u64) as u16
    }

    /// Files one segment into the buffer. In-sequence arrivals return the
    ///  contiguous run that became deliverable, everything else is buffered,
    ///  dropped as duplicate, or discarded as out of window.
    pub fn on_segment(&mut self, seq: u32, payload: Bytes, fin: bool) -> Arrival {
        if seq < self.expected_seq {
            trace!("segment {} is below expected {}, duplicate", seq, self.expected_seq);
            return Arrival::Duplicate;
        }

        if seq > self.expected_seq {
            let span_bytes = self.capacity_segments as u64 * self.max_segment_payload as u64;
            if seq as u64 > self.expected_seq as u64 + span_bytes {
                warn!(
                    "segment {} is beyond the receive window starting at {}, discarding",
                    seq, self.expected_seq
                );
                return Arrival::Discarded;
            }

            let payload_len = payload.len() as u64;
            if let Some(previous) = self.held.insert(seq, HeldSegment { payload, fin }) {
                // same sequence arrived twice, the newer copy replaces it
                self.held_bytes -= previous.payload.len() as u64;
            }
            self.held_bytes += payload_len;
            return Arrival::Held;
        }

        // in sequence: deliver it, then drain whatever it unblocked
        let mut chunks = Vec::new();
        let mut fin_reached = self.deliver(payload, fin, &mut chunks);

        while !fin_reached {
            let lowest_held = match self.held.first_key_value() {
                Some((&held_seq, _)) if held_seq <= self.expected_seq => held_seq,
                _ => break,
            };
            let held = match self.held.remove(&lowest_held) {
                Some(held) => held,
                None => break,
            };
            self.held_bytes -= held.payload.len() as u64;
            if lowest_held < self.expected_seq {
                // a stale entry overlapped by what was just delivered
                continue;
            }
            fin_reached = self.deliver(held.payload, held.fin, &mut chunks);
        }

        Arrival::Delivered { chunks, fin_reached }
    }

    fn deliver(&mut self, payload: Bytes, fin: bool, chunks: &mut Vec<Bytes>) -> bool {
        self.expected_seq = self.expected_seq.wrapping_add(payload.len() as u32);
        if !payload.is_empty() {
            chunks.push(payload);
        }
        if fin {
            // the stream-ending segment consumes one sequence number
            self.expected_seq = self.expected_seq.wrapping_add(1);
        }
        fin
    }
}

enum ReceiverState {
    Established,
    Lingering { until: Instant },
    Closed,
}

/// The receiving state machine and its control loop.
pub struct Receiver<C> {
    config: RuftConfig,
    channel: C,
    peer: SocketAddr,
    buffer: ReceiveBuffer,
    state: ReceiverState,
    stats: ReceiveStats,
    local_isn: u32,
    initial_expected: u32,
}

impl<C: DatagramChannel> Receiver<C> {
    /// Waits for a connecting SYN, answers it with SYN+ACK and returns the
    ///  established receiver. Waits indefinitely - a server has nothing else
    ///  to do - and ignores datagrams that are not a fresh SYN.
    pub async fn accept(mut channel: C, config: RuftConfig) -> anyhow::Result<Receiver<C>> {
        config.validate()?;

        loop {
            let received = channel
                .recv(config.idle_timeout)
                .await
                .map_err(TransferError::ChannelUnavailable)?;

            let (datagram, from) = match received {
                None => {
                    debug!("no connection attempt yet, keep listening");
                    continue;
                }
                Some(received) => received,
            };

            let segment = match Segment::decode(&datagram) {
                Ok(segment) => segment,
                Err(e) => {
                    debug!("undecodable datagram from {} while listening ({}), ignoring", from, e);
                    continue;
                }
            };

            if segment.flags != SegmentFlags::SYN {
                debug!("ignoring {:?} from {} while waiting for a SYN", segment.flags, from);
                continue;
            }

            let local_isn = rand::thread_rng().gen_range(0..=100_000);
            let initial_expected = segment.seq.wrapping_add(1);

            let mut receiver = Receiver {
                buffer: ReceiveBuffer::new(initial_expected, &config),
                config,
                channel,
                peer: from,
                state: ReceiverState::Established,
                stats: ReceiveStats::default(),
                local_isn,
                initial_expected,
            };
            receiver.send_syn_ack().await?;
            info!("accepted connection from {}, expecting data at {}", from, initial_expected);
            return Ok(receiver);
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Runs the transfer: reorder, deliver, acknowledge, until the
    ///  stream-ending segment has been delivered and the linger interval has
    ///  passed. Total silence for longer than the idle timeout aborts.
    pub async fn run(&mut self, sink: &mut PayloadSink) -> anyhow::Result<ReceiveStats> {
        let started = Instant::now();

        loop {
            match self.state {
                ReceiverState::Closed => break,

                ReceiverState::Established => {
                    let received = self
                        .channel
                        .recv(self.config.idle_timeout)
                        .await
                        .map_err(TransferError::ChannelUnavailable)?;
                    match received {
                        None => {
                            error!(
                                "nothing from {} for {:?}, aborting",
                                self.peer, self.config.idle_timeout
                            );
                            return Err(TransferError::DeadlineExceeded(self.config.idle_timeout).into());
                        }
                        Some((datagram, from)) => self.on_datagram(&datagram, from, sink).await?,
                    }
                }

                ReceiverState::Lingering { until } => {
                    let now = Instant::now();
                    if now >= until {
                        self.state = ReceiverState::Closed;
                        continue;
                    }
                    let received = self
                        .channel
                        .recv(until - now)
                        .await
                        .map_err(TransferError::ChannelUnavailable)?;
                    match received {
                        None => self.state = ReceiverState::Closed,
                        Some((datagram, from)) => self.on_datagram(&datagram, from, sink).await?,
                    }
                }
            }
        }

        self.stats.elapsed = started.elapsed();
        info!(
            "received {} bytes in {} segments ({:.1} KiB/s), {} out of order, {} duplicates, {} malformed",
            self.stats.bytes_delivered,
            self.stats.segments_delivered,
            self.stats.throughput_kib_per_sec(),
            self.stats.out_of_order,
            self.stats.duplicates,
            self.stats.malformed,
        );
        Ok(self.stats.clone())
    }

    async fn on_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        sink: &mut PayloadSink,
    ) -> anyhow::Result<()> {
        if from != self.peer {
            debug!("ignoring datagram from {}, connected to {}", from, self.peer);
            return Ok(());
        }

        let segment = match Segment::decode(datagram) {
            Ok(segment) => segment,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("received undecodable datagram from {} ({}), dropping", from, e);
                return Ok(());
            }
        };

        self.on_segment(segment, sink).await
    }

    async fn on_segment(&mut self, segment: Segment, sink: &mut PayloadSink) -> anyhow::Result<()> {
        if segment.flags.contains(SegmentFlags::SYN) {
            // our SYN+ACK was lost if the peer still sends SYNs; once data
            //  has flowed a SYN can only be ancient and is ignored
            if self.buffer.expected_seq() == self.initial_expected {
                debug!("duplicate SYN from {}, repeating SYN+ACK", self.peer);
                self.send_syn_ack().await?;
            } else {
                debug!("ignoring late SYN from {}", self.peer);
            }
            return Ok(());
        }

        if segment.flags.intersects(SegmentFlags::DATA | SegmentFlags::FIN) {
            let is_fin = segment.flags.contains(SegmentFlags::FIN);
            let seq = segment.seq;

            match self.buffer.on_segment(seq, segment.payload, is_fin) {
                Arrival::Delivered { chunks, fin_reached } => {
                    for chunk in &chunks {
                        self.stats.bytes_delivered += chunk.len() as u64;
                        self.stats.segments_delivered += 1;
                        sink.write(chunk).await.map_err(TransferError::Sink)?;
                    }
                    if fin_reached {
                        sink.finalize().await.map_err(TransferError::Sink)?;
                        self.send_fin_ack().await?;
                        info!(
                            "stream ended at {}, lingering {:?} for duplicate FINs",
                            self.buffer.expected_seq(),
                            self.config.fin_linger
                        );
                        self.state = ReceiverState::Lingering {
                            until: Instant::now() + self.config.fin_linger,
                        };
                    } else {
                        self.send_ack().await?;
                    }
                }
                Arrival::Held => {
                    trace!("segment {} buffered ahead of {}", seq, self.buffer.expected_seq());
                    self.stats.out_of_order += 1;
                    self.send_ack().await?;
                }
                Arrival::Duplicate => {
                    self.stats.duplicates += 1;
                    if is_fin {
                        // the FIN was already delivered, the peer just missed our answer
                        self.send_fin_ack().await?;
                    } else {
                        self.send_ack().await?;
                    }
                }
                Arrival::Discarded => {
                    self.send_ack().await?;
                }
            }
            return Ok(());
        }

        if segment.flags.contains(SegmentFlags::ACK) {
            // the closing leg of the handshake, nothing to answer
            trace!("absorbing pure ACK for {}", segment.ack);
            return Ok(());
        }

        debug!("ignoring segment with unexpected flags {:?}", segment.flags);
        Ok(())
    }

    async fn send_syn_ack(&mut self) -> anyhow::Result<()> {
        let segment = Segment::syn_ack(
            self.local_isn,
            self.buffer.expected_seq(),
            self.buffer.advertised_window(),
        );
        self.send_segment(&segment).await
    }

    async fn send_ack(&mut self) -> anyhow::Result<()> {
        let segment = Segment::ack(self.buffer.expected_seq(), self.buffer.advertised_window());
        self.send_segment(&segment).await
    }

    async fn send_fin_ack(&mut self) -> anyhow::Result<()> {
        let segment = Segment::fin_ack(self.buffer.expected_seq(), self.buffer.advertised_window());
        self.send_segment(&segment).await
    }

    async fn send_segment(&mut self, segment: &Segment) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(crate::segment::HEADER_LEN + segment.payload.len());
        segment.encode(&mut buf);
        self.channel
            .send(&buf, self.peer)
            .await
            .map_err(TransferError::ChannelUnavailable)?;
        Ok(())
    }
}
