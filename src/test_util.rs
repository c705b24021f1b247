//! Utilities for testing protocol behavior without real sockets. They are
//!  used by this crate's own tests and exported for application testing: an
//!  in-memory datagram link makes it possible to run both transfer roles in
//!  one process on tokio's paused clock, with loss and reordering scripted
//!  instead of left to chance.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time;

use crate::channel::DatagramChannel;

/// Per-datagram verdict on the sending side: given the zero-based index of
///  this send and the encoded datagram, `true` delivers and `false` discards.
pub type SendFilter = Box<dyn FnMut(u64, &[u8]) -> bool + Send>;

/// One end of an in-memory datagram link. Delivery is instant and ordered;
///  unreliability is scripted through a [SendFilter] so tests stay
///  deterministic.
pub struct TestChannel {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    filter: Option<SendFilter>,
    sent: u64,
}

impl TestChannel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Installs the loss script for this end's outgoing datagrams.
    pub fn set_send_filter(&mut self, filter: SendFilter) {
        self.filter = Some(filter);
    }

    /// Number of send attempts so far, dropped ones included.
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// Two connected in-memory endpoints with fixed fake addresses.
pub fn pipe() -> (TestChannel, TestChannel) {
    let a_addr = test_addr(1);
    let b_addr = test_addr(2);
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        TestChannel {
            local_addr: a_addr,
            peer_addr: b_addr,
            tx: a_tx,
            rx: a_rx,
            filter: None,
            sent: 0,
        },
        TestChannel {
            local_addr: b_addr,
            peer_addr: a_addr,
            tx: b_tx,
            rx: b_rx,
            filter: None,
            sent: 0,
        },
    )
}

#[async_trait]
impl DatagramChannel for TestChannel {
    async fn send(&mut self, datagram: &[u8], _to: SocketAddr) -> io::Result<()> {
        let index = self.sent;
        self.sent += 1;

        if let Some(filter) = &mut self.filter {
            if !filter(index, datagram) {
                return Ok(());
            }
        }

        self.tx
            .send((Bytes::copy_from_slice(datagram), self.local_addr))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer endpoint dropped"))
    }

    async fn recv(&mut self, wait: Duration) -> io::Result<Option<(Bytes, SocketAddr)>> {
        match time::timeout(wait, self.rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer endpoint dropped",
            )),
        }
    }
}

/// convenience method for unit test code: a fixed fake socket address per
///  number, the same number giving the same address
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40_000 + number))
}

/// convenience assertion for comparing floats in test code
pub fn assert_approx_eq(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "{} != {}",
        actual,
        expected
    );
}
