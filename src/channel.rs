//! The datagram seam between the protocol loops and the outside world.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, trace};

/// An unreliable datagram transport as the protocol sees it: fire-and-forget
///  sends and a bounded-wait receive. This is a trait to facilitate mocking
///  the I/O away for testing, and to let the loss shim stack on top of a real
///  socket.
///
/// Implementations make no delivery, ordering or integrity promises, and the
///  protocol never assumes any.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramChannel: Send {
    async fn send(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Waits up to `wait` for one datagram. `None` means the wait elapsed
    ///  without traffic, which is a regular outcome - the control loops use
    ///  it to get back to polling their timers.
    async fn recv(&mut self, wait: Duration) -> io::Result<Option<(Bytes, SocketAddr)>>;
}

/// The real thing: a bound UDP socket.
///
/// The receive buffer is sized for the configured maximum datagram; anything
///  larger arrives truncated, fails to decode and is dropped like any other
///  corrupted datagram.
pub struct UdpChannel {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

impl UdpChannel {
    pub async fn bind(addr: SocketAddr, max_datagram_size: usize) -> io::Result<UdpChannel> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(UdpChannel {
            socket,
            recv_buf: vec![0; max_datagram_size],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        trace!("sending {} bytes to {}", datagram.len(), to);
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> io::Result<Option<(Bytes, SocketAddr)>> {
        match time::timeout(wait, self.socket.recv_from(&mut self.recv_buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok((len, from))) => {
                trace!("received {} bytes from {}", len, from);
                Ok(Some((Bytes::copy_from_slice(&self.recv_buf[..len]), from)))
            }
            Ok(Err(e)) => Err(e),
        }
    }
}

/// Decorator that discards a configured fraction of received datagrams before
///  the protocol ever sees them, simulating an unreliable network on an
///  otherwise well-behaved link. Applies to every datagram kind alike; the
///  protocol's retransmission machinery covers handshake and teardown too.
pub struct LossyChannel<C> {
    inner: C,
    loss_rate: f64,
    rng: StdRng,
    dropped: u64,
}

impl<C> LossyChannel<C> {
    pub fn new(inner: C, loss_rate: f64) -> LossyChannel<C> {
        LossyChannel::seeded(inner, loss_rate, rand::thread_rng().gen())
    }

    /// Same shim with a fixed seed, for reproducible drop patterns in tests.
    pub fn seeded(inner: C, loss_rate: f64, seed: u64) -> LossyChannel<C> {
        LossyChannel {
            inner,
            loss_rate: loss_rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            dropped: 0,
        }
    }

    /// Number of datagrams discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: DatagramChannel> DatagramChannel for LossyChannel<C> {
    async fn send(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.inner.send(datagram, to).await
    }

    async fn recv(&mut self, wait: Duration) -> io::Result<Option<(Bytes, SocketAddr)>> {
        let deadline = time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match self.inner.recv(remaining).await? {
                None => return Ok(None),
                Some((datagram, from)) => {
                    if self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate) {
                        self.dropped += 1;
                        debug!("loss shim: discarding {} byte datagram from {}", datagram.len(), from);
                        continue;
                    }
                    return Ok(Some((datagram, from)));
                }
            }
        }
    }
}
