//! Sending role: connection establishment, windowed transmission with
//!  retransmission on timeout or duplicate ACKs, and the closing exchange.
//!
//! All protocol state is owned by the single control loop; the only
//!  suspension point is the bounded-wait receive on the datagram channel,
//!  bounded by the retransmission timer's deadline.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::channel::DatagramChannel;
use crate::config::RuftConfig;
use crate::congestion::CongestionControl;
use crate::error::TransferError;
use crate::flow::FlowControl;
use crate::payload::PayloadSource;
use crate::retransmit::{backed_off, RetransmitTimer};
use crate::rtt::RttEstimator;
use crate::segment::{Segment, SegmentFlags, HEADER_LEN};
use crate::stats::SendStats;

/// One transmitted but unacknowledged segment, kept verbatim so a
///  retransmission puts the identical datagram on the wire.
struct InFlight {
    wire: Bytes,
    sent_at: Instant,
    retries: u32,
}

/// What a cumulative ACK did to the send window.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The window base moved forward. `rtt_sample` is the round trip of the
    ///  oldest acknowledged segment; it is absent when that segment had been
    ///  retransmitted, because an ACK for a retransmitted segment does not
    ///  tell which transmission it answers.
    Advanced { rtt_sample: Option<Duration> },
    /// The base was acknowledged again while segments are outstanding, which
    ///  means the peer received something beyond a gap.
    Duplicate { count: u32 },
    /// Below the window base, or acknowledging data that was never sent.
    Stale,
}

/// Outstanding segments between the lowest unacknowledged sequence number
///  (the base) and the next one to assign.
pub struct SendWindow {
    base: u32,
    next_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,
    dup_acks: u32,
}

impl SendWindow {
    pub fn new(initial_seq: u32) -> SendWindow {
        SendWindow {
            base: initial_seq,
            next_seq: initial_seq,
            in_flight: BTreeMap::new(),
            dup_acks: 0,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Records a freshly transmitted segment occupying `advance` sequence
    ///  numbers and returns the sequence number it was assigned.
    pub fn register(&mut self, advance: u32, wire: Bytes, now: Instant) -> u32 {
        let seq = self.next_seq;
        self.in_flight.insert(
            seq,
            InFlight {
                wire,
                sent_at: now,
                retries: 0,
            },
        );
        self.next_seq = self.next_seq.wrapping_add(advance);
        seq
    }

    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        if ack > self.next_seq {
            warn!(
                "ACK {} acknowledges data beyond {} which was never sent, ignoring",
                ack, self.next_seq
            );
            return AckOutcome::Stale;
        }

        if ack > self.base {
            let old_base = self.base;
            let mut rtt_sample = None;
            let acked: Vec<u32> = self.in_flight.range(..ack).map(|(&seq, _)| seq).collect();
            for seq in acked {
                if let Some(entry) = self.in_flight.remove(&seq) {
                    if seq == old_base && entry.retries == 0 {
                        rtt_sample = Some(now.saturating_duration_since(entry.sent_at));
                    }
                }
            }
            self.base = ack;
            self.dup_acks = 0;
            return AckOutcome::Advanced { rtt_sample };
        }

        if ack == self.base && !self.in_flight.is_empty() {
            self.dup_acks += 1;
            return AckOutcome::Duplicate { count: self.dup_acks };
        }

        AckOutcome::Stale
    }

    pub fn reset_dup_acks(&mut self) {
        self.dup_acks = 0;
    }

    /// Retransmission count of the oldest outstanding segment.
    pub fn base_retries(&self) -> u32 {
        self.in_flight.get(&self.base).map(|entry| entry.retries).unwrap_or(0)
    }

    /// Bumps the retry count of `seq` and hands back its wire bytes for
    ///  resending, or `None` if it is no longer outstanding.
    pub fn prepare_retransmit(&mut self, seq: u32, now: Instant) -> Option<(Bytes, u32)> {
        let entry = self.in_flight.get_mut(&seq)?;
        entry.retries += 1;
        entry.sent_at = now;
        Some((entry.wire.clone(), entry.retries))
    }
}

fn encode_segment(segment: &Segment) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + segment.payload.len());
    segment.encode(&mut buf);
    buf.freeze()
}

enum SenderState {
    Idle,
    Sending,
    Closing,
    Closed,
}

/// The sending state machine and its control loop.
pub struct Sender<C> {
    config: RuftConfig,
    channel: C,
    peer: SocketAddr,
    window: SendWindow,
    congestion: CongestionControl,
    flow: FlowControl,
    rtt: RttEstimator,
    timer: RetransmitTimer,
    expected_peer_seq: u32,
    stats: SendStats,
    state: SenderState,
}

impl<C: DatagramChannel> Sender<C> {
    /// Performs the connection handshake: sends a SYN, waits for the
    ///  matching SYN+ACK and completes with a pure ACK. A lost SYN or
    ///  SYN+ACK is covered by resending the SYN up to the retry budget.
    pub async fn connect(mut channel: C, peer: SocketAddr, config: RuftConfig) -> anyhow::Result<Sender<C>> {
        config.validate()?;

        let isn: u32 = rand::thread_rng().gen_range(0..=100_000);
        let syn = encode_segment(&Segment::syn(isn, config.receive_window));

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                debug!("SYN unanswered, sending attempt {}", attempt + 1);
            }
            channel
                .send(&syn, peer)
                .await
                .map_err(TransferError::ChannelUnavailable)?;

            let attempt_deadline = Instant::now() + config.handshake_timeout;
            loop {
                let now = Instant::now();
                if now >= attempt_deadline {
                    break;
                }
                let received = channel
                    .recv(attempt_deadline - now)
                    .await
                    .map_err(TransferError::ChannelUnavailable)?;
                let (datagram, from) = match received {
                    None => break,
                    Some(received) => received,
                };
                if from != peer {
                    debug!("ignoring datagram from {} while connecting to {}", from, peer);
                    continue;
                }
                let segment = match Segment::decode(&datagram) {
                    Ok(segment) => segment,
                    Err(e) => {
                        debug!("undecodable datagram during handshake ({}), ignoring", e);
                        continue;
                    }
                };

                if segment.flags == SegmentFlags::SYN | SegmentFlags::ACK
                    && segment.ack == isn.wrapping_add(1)
                {
                    let mut sender = Sender {
                        window: SendWindow::new(isn.wrapping_add(1)),
                        congestion: CongestionControl::new(&config),
                        flow: FlowControl::new(),
                        rtt: RttEstimator::new(&config),
                        timer: RetransmitTimer::new(),
                        expected_peer_seq: segment.seq.wrapping_add(1),
                        stats: SendStats::default(),
                        state: SenderState::Idle,
                        config,
                        channel,
                        peer,
                    };
                    sender.flow.on_window_advertisement(segment.window);
                    sender
                        .send_segment(&Segment::ack(
                            sender.expected_peer_seq,
                            sender.config.receive_window,
                        ))
                        .await?;
                    info!(
                        "connected to {}, data starts at sequence {}",
                        peer,
                        isn.wrapping_add(1)
                    );
                    return Ok(sender);
                }
                debug!("ignoring {:?} during handshake", segment.flags);
            }
        }

        error!(
            "no answer from {} after {} connection attempts, giving up",
            peer,
            config.max_retries + 1
        );
        Err(TransferError::RetryExhausted {
            seq: isn,
            attempts: config.max_retries + 1,
        }
        .into())
    }

    /// Runs the transfer: pump payload into the window as congestion and
    ///  flow control allow, process ACKs, retransmit on timeout or
    ///  triplicate duplicate ACKs, and close with a FIN once the source is
    ///  exhausted and all data is acknowledged. Returns once the FIN is
    ///  acknowledged.
    pub async fn run(&mut self, source: &mut PayloadSource) -> anyhow::Result<SendStats> {
        let started = Instant::now();

        loop {
            if matches!(self.state, SenderState::Closed) {
                break;
            }

            if let Some(limit) = self.config.overall_deadline {
                if started.elapsed() >= limit {
                    error!("transfer did not complete within {:?}, aborting", limit);
                    return Err(TransferError::DeadlineExceeded(limit).into());
                }
            }

            self.pump(source).await?;

            if let Some(expired_seq) = self.timer.poll(Instant::now()) {
                self.on_retransmit_timeout(expired_seq).await?;
                continue;
            }

            let wait = self.recv_wait(started);
            let received = self
                .channel
                .recv(wait)
                .await
                .map_err(TransferError::ChannelUnavailable)?;
            match received {
                // the timer poll at the top of the loop handles the expiry
                None => continue,
                Some((datagram, from)) => self.on_datagram(&datagram, from).await?,
            }
        }

        self.stats.elapsed = started.elapsed();
        info!(
            "sent {} bytes in {} segments with {} retransmissions ({:.1} KiB/s)",
            self.stats.bytes_sent,
            self.stats.segments_sent,
            self.stats.retransmissions,
            self.stats.throughput_kib_per_sec(),
        );
        Ok(self.stats.clone())
    }

    /// Transmits payload until the effective window is full or the source
    ///  runs dry. The FIN follows only once everything sent has been
    ///  acknowledged, whereupon the state moves to closing; an empty source
    ///  goes from idle straight to closing.
    async fn pump(&mut self, source: &mut PayloadSource) -> anyhow::Result<()> {
        if matches!(self.state, SenderState::Closing | SenderState::Closed) {
            return Ok(());
        }

        while (self.window.outstanding() as u32) < self.flow.effective_window(self.congestion.cwnd()) {
            let chunk = source
                .next_chunk(self.config.max_segment_payload)
                .await
                .map_err(TransferError::Source)?;
            let now = Instant::now();

            match chunk {
                Some(chunk) => {
                    self.state = SenderState::Sending;
                    let seq = self.window.next_seq();
                    let advance = chunk.len() as u32;
                    let segment =
                        Segment::data(seq, self.expected_peer_seq, self.config.receive_window, chunk);
                    let wire = encode_segment(&segment);
                    self.channel
                        .send(&wire, self.peer)
                        .await
                        .map_err(TransferError::ChannelUnavailable)?;
                    self.window.register(advance, wire, now);
                    self.stats.bytes_sent += advance as u64;
                    self.stats.segments_sent += 1;
                    trace!(
                        "sent segment {} ({} bytes), {} outstanding",
                        seq,
                        advance,
                        self.window.outstanding()
                    );
                    if self.timer.deadline().is_none() {
                        self.timer.start(seq, now + self.rtt.rto());
                    }
                }
                None => {
                    // the FIN must not leave while data is unacknowledged
                    if !self.window.is_empty() {
                        break;
                    }
                    let seq = self.window.next_seq();
                    let wire = encode_segment(&Segment::fin(seq));
                    self.channel
                        .send(&wire, self.peer)
                        .await
                        .map_err(TransferError::ChannelUnavailable)?;
                    self.window.register(1, wire, now);
                    self.timer.start(seq, now + self.rtt.rto());
                    self.state = SenderState::Closing;
                    info!("payload exhausted, closing at sequence {}", seq);
                    break;
                }
            }
        }
        Ok(())
    }

    /// How long the control loop may block waiting for datagrams: until the
    ///  retransmission deadline, further capped by the overall deadline.
    fn recv_wait(&self, started: Instant) -> Duration {
        let now = Instant::now();
        let mut wait = match self.timer.deadline() {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.rtt.rto(),
        };
        if let Some(limit) = self.config.overall_deadline {
            wait = wait.min(limit.saturating_sub(started.elapsed()));
        }
        wait.max(Duration::from_millis(1))
    }

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        if from != self.peer {
            debug!("ignoring datagram from {}, connected to {}", from, self.peer);
            return Ok(());
        }

        let segment = match Segment::decode(datagram) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("received undecodable datagram from {} ({}), dropping", from, e);
                return Ok(());
            }
        };

        if segment.flags == SegmentFlags::SYN | SegmentFlags::ACK {
            // our handshake ACK was lost and no data has arrived over there yet
            debug!("repeated SYN+ACK from {}, answering again", from);
            self.send_segment(&Segment::ack(self.expected_peer_seq, self.config.receive_window))
                .await?;
            return Ok(());
        }

        if segment.flags.contains(SegmentFlags::DATA) {
            // this transport is one-directional, the peer has no data to send
            debug!("ignoring data-bearing segment from {}", from);
            return Ok(());
        }

        if !segment.flags.contains(SegmentFlags::ACK) {
            debug!("ignoring segment without ACK, flags {:?}", segment.flags);
            return Ok(());
        }

        self.flow.on_window_advertisement(segment.window);

        let now = Instant::now();
        match self.window.on_ack(segment.ack, now) {
            AckOutcome::Advanced { rtt_sample } => {
                self.congestion.on_ack();
                if let Some(sample) = rtt_sample {
                    self.rtt.on_sample(sample);
                }
                trace!(
                    "ack {} advanced the window, cwnd {}, rto {:?}",
                    segment.ack,
                    self.congestion.cwnd(),
                    self.rtt.rto()
                );
                if self.window.is_empty() {
                    self.timer.clear();
                    if matches!(self.state, SenderState::Closing) {
                        debug!("closing segment acknowledged");
                        self.state = SenderState::Closed;
                    }
                } else {
                    let backoff =
                        backed_off(self.rtt.rto(), self.window.base_retries(), self.config.max_rto);
                    self.timer.start(self.window.base(), now + backoff);
                }
            }
            AckOutcome::Duplicate { count } => {
                self.stats.duplicate_acks += 1;
                trace!("duplicate ack for {} ({} in a row)", segment.ack, count);
                if count == self.config.dup_ack_threshold {
                    self.fast_retransmit().await?;
                }
            }
            AckOutcome::Stale => {}
        }
        Ok(())
    }

    async fn fast_retransmit(&mut self) -> anyhow::Result<()> {
        let seq = self.window.base();
        warn!(
            "{} duplicate ACKs for {}, retransmitting ahead of the timer",
            self.config.dup_ack_threshold, seq
        );
        self.window.reset_dup_acks();
        self.retransmit(seq).await
    }

    async fn on_retransmit_timeout(&mut self, expired_seq: u32) -> anyhow::Result<()> {
        if self.window.is_empty() {
            return Ok(());
        }
        // the timer guards the oldest outstanding segment
        let seq = self.window.base();
        warn!("retransmission timer fired for {}, oldest outstanding is {}", expired_seq, seq);
        self.retransmit(seq).await
    }

    async fn retransmit(&mut self, seq: u32) -> anyhow::Result<()> {
        if self.window.base_retries() >= self.config.max_retries {
            error!(
                "segment {} unacknowledged after {} transmissions, giving up",
                seq,
                self.config.max_retries + 1
            );
            return Err(TransferError::RetryExhausted {
                seq,
                attempts: self.config.max_retries + 1,
            }
            .into());
        }

        let now = Instant::now();
        let (wire, retries) = match self.window.prepare_retransmit(seq, now) {
            Some(prepared) => prepared,
            None => return Ok(()),
        };
        self.channel
            .send(&wire, self.peer)
            .await
            .map_err(TransferError::ChannelUnavailable)?;
        self.stats.retransmissions += 1;
        self.congestion.on_loss();

        let backoff = backed_off(self.rtt.rto(), retries, self.config.max_rto);
        self.timer.start(seq, now + backoff);
        debug!("retransmitted {} (transmission {}), next timeout in {:?}", seq, retries + 1, backoff);
        Ok(())
    }

    async fn send_segment(&mut self, segment: &Segment) -> anyhow::Result<()> {
        let wire = encode_segment(segment);
        self.channel
            .send(&wire, self.peer)
            .await
            .map_err(TransferError::ChannelUnavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LossyChannel, MockDatagramChannel};
    use crate::payload::PayloadSink;
    use crate::receiver::Receiver;
    use crate::stats::ReceiveStats;
    use crate::test_util::{pipe, test_addr, SendFilter};
    use std::sync::{Arc, Mutex};
    use tokio::time;

    fn wire_bytes(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn test_register_tracks_outstanding_segments() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);

        assert_eq!(window.register(100, wire_bytes(1), now), 1000);
        assert_eq!(window.register(100, wire_bytes(2), now), 1100);

        assert_eq!(window.base(), 1000);
        assert_eq!(window.next_seq(), 1200);
        assert_eq!(window.outstanding(), 2);
        assert!(!window.is_empty());
    }

    #[test]
    fn test_cumulative_ack_clears_everything_below() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), now);
        window.register(100, wire_bytes(2), now);
        window.register(100, wire_bytes(3), now);

        let outcome = window.on_ack(1300, now);

        assert!(matches!(outcome, AckOutcome::Advanced { .. }));
        assert_eq!(window.base(), 1300);
        assert!(window.is_empty());
    }

    #[test]
    fn test_partial_ack_advances_to_first_unacknowledged() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), now);
        window.register(100, wire_bytes(2), now);
        window.register(100, wire_bytes(3), now);

        window.on_ack(1200, now);

        assert_eq!(window.base(), 1200);
        assert_eq!(window.outstanding(), 1);
    }

    #[test]
    fn test_ack_at_base_counts_duplicates() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), now);
        window.register(100, wire_bytes(2), now);

        assert_eq!(window.on_ack(1000, now), AckOutcome::Duplicate { count: 1 });
        assert_eq!(window.on_ack(1000, now), AckOutcome::Duplicate { count: 2 });
        assert_eq!(window.on_ack(1000, now), AckOutcome::Duplicate { count: 3 });
    }

    #[test]
    fn test_duplicate_count_restarts_after_advance() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), now);
        window.register(100, wire_bytes(2), now);

        window.on_ack(1000, now);
        window.on_ack(1000, now);
        window.on_ack(1100, now);

        assert_eq!(window.on_ack(1100, now), AckOutcome::Duplicate { count: 1 });
    }

    #[test]
    fn test_ack_below_base_is_stale() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), now);
        window.on_ack(1100, now);

        assert_eq!(window.on_ack(1000, now), AckOutcome::Stale);
    }

    #[test]
    fn test_ack_beyond_sent_data_is_ignored() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), now);

        assert_eq!(window.on_ack(1500, now), AckOutcome::Stale);
        assert_eq!(window.base(), 1000);
        assert_eq!(window.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_is_sampled_from_fresh_segments_only() {
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(1), Instant::now());

        time::advance(Duration::from_millis(150)).await;
        let outcome = window.on_ack(1100, Instant::now());
        assert_eq!(
            outcome,
            AckOutcome::Advanced {
                rtt_sample: Some(Duration::from_millis(150))
            }
        );

        // a retransmitted segment must not contribute a sample
        window.register(100, wire_bytes(2), Instant::now());
        window.prepare_retransmit(1100, Instant::now());
        time::advance(Duration::from_millis(80)).await;
        let outcome = window.on_ack(1200, Instant::now());
        assert_eq!(outcome, AckOutcome::Advanced { rtt_sample: None });
    }

    #[test]
    fn test_prepare_retransmit_bumps_retries_and_returns_wire() {
        let now = Instant::now();
        let mut window = SendWindow::new(1000);
        window.register(100, wire_bytes(7), now);

        assert_eq!(window.base_retries(), 0);
        let (wire, retries) = window.prepare_retransmit(1000, now).unwrap();
        assert_eq!(wire, wire_bytes(7));
        assert_eq!(retries, 1);
        assert_eq!(window.base_retries(), 1);

        assert!(window.prepare_retransmit(9999, now).is_none());
    }

    // ---- handshake against a mocked channel ----

    fn test_config() -> RuftConfig {
        let mut config = RuftConfig::new();
        config.max_segment_payload = 512;
        config.receive_window = 8;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_repeats_lost_syn_until_answered() {
        let peer = test_addr(9);
        let captured_isn = Arc::new(Mutex::new(None::<u32>));

        let mut channel = MockDatagramChannel::new();
        let isn_writer = captured_isn.clone();
        channel.expect_send().times(3).returning(move |datagram, _| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags == SegmentFlags::SYN {
                    *isn_writer.lock().unwrap() = Some(segment.seq);
                }
            }
            Ok(())
        });
        channel.expect_recv().times(1).returning(|_| Ok(None));
        let isn_reader = captured_isn.clone();
        channel.expect_recv().times(1).returning(move |_| {
            let isn = isn_reader.lock().unwrap().unwrap();
            let syn_ack = Segment::syn_ack(50_000, isn.wrapping_add(1), 4);
            Ok(Some((encode_segment(&syn_ack), test_addr(9))))
        });

        let sender = Sender::connect(channel, peer, test_config()).await.unwrap();

        assert_eq!(sender.expected_peer_seq, 50_001);
        assert_eq!(sender.flow.peer_window(), 4);
        assert_eq!(sender.window.base(), captured_isn.lock().unwrap().unwrap() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_retry_budget() {
        let mut config = test_config();
        config.max_retries = 2;
        config.handshake_timeout = Duration::from_millis(100);

        let mut channel = MockDatagramChannel::new();
        channel.expect_send().times(3).returning(|_, _| Ok(()));
        channel.expect_recv().returning(|_| Ok(None));

        let err = Sender::connect(channel, test_addr(9), config).await.err().unwrap();

        match err.downcast_ref::<TransferError>() {
            Some(TransferError::RetryExhausted { attempts: 3, .. }) => {}
            other => panic!("expected RetryExhausted after 3 attempts, got {:?}", other),
        }
    }

    // ---- end-to-end transfers over an in-memory link ----

    fn synthetic_bytes(total: usize) -> Vec<u8> {
        (0..total).map(|i| (i % 256) as u8).collect()
    }

    async fn run_transfer(
        total_bytes: u64,
        sender_config: RuftConfig,
        receiver_config: RuftConfig,
        sender_filter: Option<SendFilter>,
    ) -> (SendStats, ReceiveStats, Vec<u8>) {
        let (mut client_channel, server_channel) = pipe();
        if let Some(filter) = sender_filter {
            client_channel.set_send_filter(filter);
        }
        let server_addr = client_channel.peer_addr();

        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(server_channel, receiver_config).await?;
            let mut sink = PayloadSink::memory();
            let stats = receiver.run(&mut sink).await?;
            anyhow::Ok((stats, sink))
        });

        let mut sender = Sender::connect(client_channel, server_addr, sender_config)
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(total_bytes);
        let send_stats = sender.run(&mut source).await.unwrap();

        let (receive_stats, sink) = receiver_task.await.unwrap().unwrap();
        let delivered = sink.as_memory().unwrap().to_vec();
        (send_stats, receive_stats, delivered)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_delivers_whole_payload_in_order() {
        let (send_stats, receive_stats, delivered) =
            run_transfer(4096, test_config(), test_config(), None).await;

        assert_eq!(delivered, synthetic_bytes(4096));
        assert_eq!(send_stats.bytes_sent, 4096);
        assert_eq!(send_stats.segments_sent, 8);
        assert_eq!(send_stats.retransmissions, 0);
        assert_eq!(send_stats.duplicate_acks, 0);
        assert_eq!(receive_stats.bytes_delivered, 4096);
        assert_eq!(receive_stats.segments_delivered, 8);
        assert_eq!(receive_stats.duplicates, 0);
        assert_eq!(receive_stats.malformed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_is_just_handshake_and_fin() {
        let (send_stats, receive_stats, delivered) =
            run_transfer(0, test_config(), test_config(), None).await;

        assert!(delivered.is_empty());
        assert_eq!(send_stats.bytes_sent, 0);
        assert_eq!(send_stats.segments_sent, 0);
        assert_eq!(receive_stats.segments_delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_dropped_segment_is_recovered() {
        // dropping the sixth of twelve data segments leaves enough traffic
        //  behind the gap for triplicate duplicate ACKs to trigger the fast
        //  path
        let mut data_seen = 0u32;
        let filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::DATA) {
                    data_seen += 1;
                    if data_seen == 6 {
                        return false;
                    }
                }
            }
            true
        });

        let (send_stats, receive_stats, delivered) =
            run_transfer(6144, test_config(), test_config(), Some(filter)).await;

        assert_eq!(delivered, synthetic_bytes(6144));
        assert_eq!(send_stats.retransmissions, 1);
        assert!(send_stats.duplicate_acks >= 3);
        assert!(receive_stats.out_of_order >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recovery_collapses_the_congestion_window() {
        // the third data segment disappears while the window is still small,
        //  so too few duplicate ACKs accumulate and recovery must come from
        //  the timer
        let mut data_seen = 0u32;
        let filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::DATA) {
                    data_seen += 1;
                    if data_seen == 3 {
                        return false;
                    }
                }
            }
            true
        });

        let (mut client_channel, server_channel) = pipe();
        client_channel.set_send_filter(filter);
        let server_addr = client_channel.peer_addr();

        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(server_channel, test_config()).await?;
            let mut sink = PayloadSink::memory();
            let stats = receiver.run(&mut sink).await?;
            anyhow::Ok((stats, sink))
        });

        let mut sender = Sender::connect(client_channel, server_addr, test_config())
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(4096);
        let send_stats = sender.run(&mut source).await.unwrap();

        let (_, sink) = receiver_task.await.unwrap().unwrap();
        assert_eq!(sink.as_memory().unwrap(), synthetic_bytes(4096).as_slice());
        assert_eq!(send_stats.retransmissions, 1);
        assert_eq!(send_stats.duplicate_acks, 2);
        // at the moment of loss the window was three segments, so the
        //  threshold halved to one and was never touched again
        assert_eq!(sender.congestion.ssthresh(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_fin_is_retransmitted() {
        let mut fins_seen = 0u32;
        let filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::FIN) {
                    fins_seen += 1;
                    if fins_seen == 1 {
                        return false;
                    }
                }
            }
            true
        });

        let (send_stats, _, delivered) =
            run_transfer(1024, test_config(), test_config(), Some(filter)).await;

        assert_eq!(delivered, synthetic_bytes(1024));
        assert_eq!(send_stats.retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fin_is_sent_only_after_all_data_is_acknowledged() {
        // the server side records every cumulative ACK as it leaves, the
        //  client side pairs that with the FIN's own sequence number the
        //  moment the FIN departs
        let acked = Arc::new(Mutex::new(0u32));
        let at_fin = Arc::new(Mutex::new(None::<(u32, u32)>));

        let (mut client_channel, mut server_channel) = pipe();

        let acked_writer = acked.clone();
        let server_filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::ACK) {
                    let mut acked = acked_writer.lock().unwrap();
                    *acked = segment.ack.max(*acked);
                }
            }
            true
        });
        server_channel.set_send_filter(server_filter);

        let acked_reader = acked.clone();
        let at_fin_writer = at_fin.clone();
        let client_filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::FIN) {
                    let acked = *acked_reader.lock().unwrap();
                    at_fin_writer.lock().unwrap().get_or_insert((acked, segment.seq));
                }
            }
            true
        });
        client_channel.set_send_filter(client_filter);

        let server_addr = client_channel.peer_addr();
        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(server_channel, test_config()).await?;
            let mut sink = PayloadSink::memory();
            receiver.run(&mut sink).await?;
            anyhow::Ok(sink)
        });

        let mut sender = Sender::connect(client_channel, server_addr, test_config())
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(4096);
        sender.run(&mut source).await.unwrap();

        let sink = receiver_task.await.unwrap().unwrap();
        assert_eq!(sink.as_memory().unwrap(), synthetic_bytes(4096).as_slice());

        // everything up to the FIN's own sequence number had been
        //  acknowledged before the FIN left
        let (acked_at_fin, fin_seq) = at_fin.lock().unwrap().unwrap();
        assert_eq!(acked_at_fin, fin_seq);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_handshake_ack_is_covered_by_first_data() {
        // the concluding pure ACK of the handshake disappears; the first
        //  data segment carries the same acknowledgment
        let mut pure_acks_seen = 0u32;
        let filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags == SegmentFlags::ACK {
                    pure_acks_seen += 1;
                    if pure_acks_seen == 1 {
                        return false;
                    }
                }
            }
            true
        });

        let (_, receive_stats, delivered) =
            run_transfer(1024, test_config(), test_config(), Some(filter)).await;

        assert_eq!(delivered, synthetic_bytes(1024));
        assert_eq!(receive_stats.bytes_delivered, 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tight_receiver_window_still_completes() {
        let mut receiver_config = test_config();
        receiver_config.receive_window = 2;

        let (send_stats, receive_stats, delivered) =
            run_transfer(4096, test_config(), receiver_config, None).await;

        assert_eq!(delivered, synthetic_bytes(4096));
        assert_eq!(send_stats.segments_sent, 8);
        // with at most two segments in flight nothing ever arrives out of order
        assert_eq!(receive_stats.out_of_order, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_data_never_exceeds_the_advertised_window() {
        // the server advertises two segments while the congestion window
        //  grows well past that; every departing data segment is counted
        //  against the acknowledgments already seen on the return direction
        let acked = Arc::new(Mutex::new(0u32));
        let peak_in_flight = Arc::new(Mutex::new(0usize));

        let (mut client_channel, mut server_channel) = pipe();

        let acked_writer = acked.clone();
        let server_filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::ACK) {
                    let mut acked = acked_writer.lock().unwrap();
                    *acked = segment.ack.max(*acked);
                }
            }
            true
        });
        server_channel.set_send_filter(server_filter);

        let acked_reader = acked.clone();
        let peak_writer = peak_in_flight.clone();
        let mut sent_ends: BTreeMap<u32, u32> = BTreeMap::new();
        let client_filter: SendFilter = Box::new(move |_, datagram| {
            if let Ok(segment) = Segment::decode(datagram) {
                if segment.flags.contains(SegmentFlags::DATA) {
                    sent_ends.insert(segment.seq, segment.seq + segment.payload.len() as u32);
                    let acked = *acked_reader.lock().unwrap();
                    let in_flight = sent_ends.values().filter(|&&end| end > acked).count();
                    let mut peak = peak_writer.lock().unwrap();
                    *peak = in_flight.max(*peak);
                }
            }
            true
        });
        client_channel.set_send_filter(client_filter);

        let server_addr = client_channel.peer_addr();
        let mut receiver_config = test_config();
        receiver_config.receive_window = 2;
        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(server_channel, receiver_config).await?;
            let mut sink = PayloadSink::memory();
            receiver.run(&mut sink).await?;
            anyhow::Ok(sink)
        });

        let mut sender = Sender::connect(client_channel, server_addr, test_config())
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(4096);
        sender.run(&mut source).await.unwrap();

        let sink = receiver_task.await.unwrap().unwrap();
        assert_eq!(sink.as_memory().unwrap(), synthetic_bytes(4096).as_slice());
        // the congestion window alone would have allowed more than two
        assert_eq!(*peak_in_flight.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_survives_random_datagram_loss() {
        fn lossy_config() -> RuftConfig {
            let mut config = RuftConfig::new();
            config.max_segment_payload = 256;
            config.receive_window = 8;
            config
        }

        let (client_channel, server_channel) = pipe();
        let server_addr = client_channel.peer_addr();

        // both directions lose a fifth of all datagrams, fixed seeds keep it
        //  reproducible
        let lossy_server = LossyChannel::seeded(server_channel, 0.2, 7);
        let lossy_client = LossyChannel::seeded(client_channel, 0.2, 8);

        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(lossy_server, lossy_config()).await?;
            let mut sink = PayloadSink::memory();
            let stats = receiver.run(&mut sink).await?;
            anyhow::Ok((stats, sink))
        });

        let mut sender = Sender::connect(lossy_client, server_addr, lossy_config())
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(3000);
        let send_stats = sender.run(&mut source).await.unwrap();

        let (receive_stats, sink) = receiver_task.await.unwrap().unwrap();
        assert_eq!(sink.as_memory().unwrap(), synthetic_bytes(3000).as_slice());
        assert_eq!(receive_stats.bytes_delivered, 3000);
        assert_eq!(send_stats.bytes_sent, 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_receiver_exhausts_retries() {
        let mut sender_config = test_config();
        sender_config.max_retries = 2;

        // the handshake passes, every data segment disappears
        let filter: SendFilter = Box::new(|_, datagram| {
            match Segment::decode(datagram) {
                Ok(segment) => !segment.flags.contains(SegmentFlags::DATA),
                Err(_) => true,
            }
        });

        let (mut client_channel, server_channel) = pipe();
        client_channel.set_send_filter(filter);
        let server_addr = client_channel.peer_addr();

        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(server_channel, test_config()).await?;
            let mut sink = PayloadSink::memory();
            receiver.run(&mut sink).await?;
            anyhow::Ok(())
        });

        let mut sender = Sender::connect(client_channel, server_addr, sender_config)
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(2048);
        let err = sender.run(&mut source).await.unwrap_err();

        match err.downcast_ref::<TransferError>() {
            Some(TransferError::RetryExhausted { attempts: 3, .. }) => {}
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
        receiver_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_aborts_a_stalled_transfer() {
        let mut sender_config = test_config();
        sender_config.overall_deadline = Some(Duration::from_secs(2));

        let filter: SendFilter = Box::new(|_, datagram| {
            match Segment::decode(datagram) {
                Ok(segment) => !segment.flags.contains(SegmentFlags::DATA),
                Err(_) => true,
            }
        });

        let (mut client_channel, server_channel) = pipe();
        client_channel.set_send_filter(filter);
        let server_addr = client_channel.peer_addr();

        let receiver_task = tokio::spawn(async move {
            let mut receiver = Receiver::accept(server_channel, test_config()).await?;
            let mut sink = PayloadSink::memory();
            receiver.run(&mut sink).await?;
            anyhow::Ok(())
        });

        let mut sender = Sender::connect(client_channel, server_addr, sender_config)
            .await
            .unwrap();
        let mut source = PayloadSource::synthetic(2048);
        let err = sender.run(&mut source).await.unwrap_err();

        match err.downcast_ref::<TransferError>() {
            Some(TransferError::DeadlineExceeded(limit)) => {
                assert_eq!(*limit, Duration::from_secs(2));
            }
            other => panic!("expected DeadlineExceeded, got {:?}", other),
        }
        receiver_task.abort();
    }
}
