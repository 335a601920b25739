use std::cmp::min;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::sync::mpsc;

use crate::transport::PacketTransport;

/// convenience method for unit test code: create a loopback address based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// what a receive call on a [TrackingTransport] returns: a datagram and its sender, or an error
pub type Inbound = io::Result<(SocketAddr, Vec<u8>)>;

/// An in-memory [PacketTransport] that records every datagram sent through it. Inbound datagrams
///  (or receive errors) are injected through the sender returned on creation; dropping that
///  sender makes receive calls fail, which is what a closed socket does.
pub struct TrackingTransport {
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}
impl TrackingTransport {
    pub fn new(local_addr: SocketAddr) -> (TrackingTransport, mpsc::UnboundedSender<Inbound>) {
        Self::create(local_addr, None)
    }

    /// a transport that behaves like a datagram socket connected to `peer_addr`
    pub fn connected(local_addr: SocketAddr, peer_addr: SocketAddr) -> (TrackingTransport, mpsc::UnboundedSender<Inbound>) {
        Self::create(local_addr, Some(peer_addr))
    }

    fn create(local_addr: SocketAddr, peer_addr: Option<SocketAddr>) -> (TrackingTransport, mpsc::UnboundedSender<Inbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let transport = TrackingTransport {
            local_addr,
            peer_addr,
            inbound: Mutex::new(receiver),
            sent: Default::default(),
        };
        (transport, sender)
    }

    /// returns sent datagrams, clearing the internal buffer
    pub fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// number of datagrams sent to `to` without clearing the internal buffer
    pub fn num_sent_to(&self, to: SocketAddr) -> usize {
        lock(&self.sent).iter()
            .filter(|(addr, _)| *addr == to)
            .count()
    }

    fn record(&self, to: SocketAddr, buf: &[u8]) -> Poll<io::Result<usize>> {
        lock(&self.sent).push((to, buf.to_vec()));
        Poll::Ready(Ok(buf.len()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PacketTransport for TrackingTransport {
    type Addr = SocketAddr;

    fn poll_recv_from(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<SocketAddr>> {
        match lock(&self.inbound).poll_recv(cx) {
            Poll::Ready(Some(Ok((from, data)))) => {
                // truncate like a real datagram socket does
                let n = min(buf.remaining(), data.len());
                buf.put_slice(&data[..n]);
                Poll::Ready(Ok(from))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "tracking transport was shut down"))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.poll_recv_from(cx, buf)
            .map_ok(|_| ())
    }

    fn poll_send_to(&self, _cx: &mut Context<'_>, buf: &[u8], target: &SocketAddr) -> Poll<io::Result<usize>> {
        self.record(*target, buf)
    }

    fn poll_send(&self, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.peer_addr {
            Some(peer_addr) => self.record(peer_addr, buf),
            None => Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected))),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.peer_addr
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}
