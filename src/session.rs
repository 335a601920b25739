use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::PacketConfig;
use crate::error::PacketError;
use crate::stream_buffer::StreamBuffer;
use crate::transport::{poll_send_to_peer, recv, send_to_peer, PacketTransport};

/// A stream-oriented connection to a single peer, emulated on top of a datagram transport.
///
/// Reading drains the bytes of all datagrams received from the peer, in arrival order. Each
///  write is sent as a single datagram. While the session is open, an empty datagram is sent to
///  the peer every [PacketConfig::heartbeat_interval].
///
/// There are two flavors of sessions:
/// * sessions accepted by a [crate::listener::PacketListener] share the listener's transport
///   with all other peers. They have an explicit peer address, and closing them leaves the
///   transport open.
/// * sessions created by [Session::connected] own a transport that is connected to its peer,
///   and they run their own receive loop.
///
/// Dropping a session closes it.
pub struct Session<T: PacketTransport> {
    transport: Arc<T>,
    peer: Option<T::Addr>,
    buffer: Arc<StreamBuffer>,
    closed: CancellationToken,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<T: PacketTransport> Session<T> {
    pub(crate) fn for_peer(transport: Arc<T>, peer: T::Addr, buffer: Arc<StreamBuffer>, config: &PacketConfig) -> Session<T> {
        Self::new(transport, Some(peer), buffer, config)
    }

    /// Wraps a datagram transport that is connected to its peer, e.g. a `UdpSocket` after
    ///  `connect()`. The session owns the transport and feeds its buffer from a receive loop of
    ///  its own, which ends when the session is closed or the transport fails.
    pub fn connected(transport: T, config: Arc<PacketConfig>) -> Session<T> {
        let transport = Arc::new(transport);
        let buffer = Arc::new(StreamBuffer::new(config.buffer_size));
        let session = Self::new(transport.clone(), None, buffer.clone(), &config);

        tokio::spawn(connected_recv_loop(transport, buffer, session.closed.clone(), config));
        session
    }

    fn new(transport: Arc<T>, peer: Option<T::Addr>, buffer: Arc<StreamBuffer>, config: &PacketConfig) -> Session<T> {
        let closed = CancellationToken::new();

        tokio::spawn(heartbeat_loop(transport.clone(), peer.clone(), config.heartbeat_interval, closed.clone()));

        Session {
            transport,
            peer,
            buffer,
            closed,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn local_addr(&self) -> io::Result<T::Addr> {
        self.transport.local_addr()
    }

    /// The peer's address, taken from the underlying transport for connected sessions
    pub fn peer_addr(&self) -> io::Result<T::Addr> {
        match &self.peer {
            Some(peer) => Ok(peer.clone()),
            None => self.transport.peer_addr(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Closes the session, stopping its heartbeat. Subsequent reads and writes fail with
    ///  [PacketError::Closed]. Calling this more than once has no effect.
    ///
    /// The transport of a listener's session stays open since it is shared with other peers.
    ///  A connected session stops its receive loop and releases the transport, which is
    ///  closed once the session itself is dropped.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!(peer = ?self.peer, "closing session");
        self.closed.cancel();
        self.buffer.close();
    }

    /// Sets (or with `None` clears) the point in time after which reads fail with
    ///  [io::ErrorKind::TimedOut]. This applies to reads that are already waiting as well.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(sleep_until(d)));
    }

    /// Must be called from inside a tokio runtime.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(sleep_until(d)));
    }

    /// sets both read and write deadline
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

fn deadline_expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "session deadline exceeded")
}

impl<T: PacketTransport> AsyncRead for Session<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.is_cancelled() {
            return Poll::Ready(Err(PacketError::closed_io_error()));
        }
        if deadline_expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        this.buffer.poll_read(cx, buf)
    }
}

impl<T: PacketTransport> AsyncWrite for Session<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.is_cancelled() {
            return Poll::Ready(Err(PacketError::closed_io_error()));
        }
        if deadline_expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        poll_send_to_peer(this.transport.as_ref(), cx, buf, this.peer.as_ref())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl<T: PacketTransport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn heartbeat_loop<T: PacketTransport>(transport: Arc<T>, peer: Option<T::Addr>, interval: Duration, closed: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {
                trace!(?peer, "sending heartbeat");
                if let Err(e) = send_to_peer(transport.as_ref(), &[], peer.as_ref()).await {
                    debug!(?peer, error = ?e, "error sending heartbeat");
                }
            }
        }
    }
    trace!(?peer, "heartbeat stopped");
}

async fn connected_recv_loop<T: PacketTransport>(transport: Arc<T>, buffer: Arc<StreamBuffer>, closed: CancellationToken, config: Arc<PacketConfig>) {
    let mut scratch = vec![0u8; config.packet_size];

    loop {
        let num_read = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            r = recv(transport.as_ref(), &mut scratch) => match r {
                Ok(n) => n,
                Err(e) if is_transient(&e) => {
                    debug!(error = ?e, "transient receive error on connected transport - ignoring");
                    continue;
                }
                Err(e) => {
                    error!(error = ?e, "error receiving from connected transport");
                    break;
                }
            }
        };
        trace!("received {} bytes on connected transport", num_read);

        let delivered = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            r = buffer.deliver(&scratch[..num_read], config.overflow) => r,
        };
        match delivered {
            Ok(true) => {}
            Ok(false) => warn!("session buffer full - dropping datagram of {} bytes", num_read),
            Err(_) => break,
        }
    }

    // readers see EOF after draining what was received so far
    buffer.close();
    trace!("receive loop of connected session ended");
}

/// Connected datagram sockets report ICMP errors for earlier sends on later receives
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset)
}
