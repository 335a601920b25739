use std::fmt::{Debug, Display, Formatter};
use std::future::poll_fn;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

/// The datagram capability a listener or session needs from the underlying socket.
///
/// All operations take `&self` since a datagram socket is shared between the receive loop (the
///  only reader) and all sessions (writers) without locking - concurrent send and receive on a
///  datagram socket is safe.
///
/// The methods are poll-based so that a [crate::session::Session] can implement
///  [tokio::io::AsyncWrite] without boxing futures.
pub trait PacketTransport: Send + Sync + 'static {
    /// The address type identifying a peer. Two datagrams belong to the same session iff their
    ///  sender addresses are equal.
    type Addr: Clone + Eq + Hash + Debug + Send + Sync + Unpin + Into<NetAddr> + 'static;

    fn poll_recv_from(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<Self::Addr>>;

    /// receive from the connected peer
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>>;

    fn poll_send_to(&self, cx: &mut Context<'_>, buf: &[u8], target: &Self::Addr) -> Poll<io::Result<usize>>;

    /// send to the connected peer
    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    fn local_addr(&self) -> io::Result<Self::Addr>;

    fn peer_addr(&self) -> io::Result<Self::Addr>;
}

pub async fn recv_from<T: PacketTransport>(transport: &T, buf: &mut [u8]) -> io::Result<(usize, T::Addr)> {
    let mut read_buf = ReadBuf::new(buf);
    let from = poll_fn(|cx| transport.poll_recv_from(cx, &mut read_buf)).await?;
    Ok((read_buf.filled().len(), from))
}

pub async fn recv<T: PacketTransport>(transport: &T, buf: &mut [u8]) -> io::Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    poll_fn(|cx| transport.poll_recv(cx, &mut read_buf)).await?;
    Ok(read_buf.filled().len())
}

/// sends a single datagram to `peer`, or to the connected peer if there is no explicit peer address
pub fn poll_send_to_peer<T: PacketTransport>(transport: &T, cx: &mut Context<'_>, buf: &[u8], peer: Option<&T::Addr>) -> Poll<io::Result<usize>> {
    match peer {
        Some(peer) => transport.poll_send_to(cx, buf, peer),
        None => transport.poll_send(cx, buf),
    }
}

pub async fn send_to_peer<T: PacketTransport>(transport: &T, buf: &[u8], peer: Option<&T::Addr>) -> io::Result<usize> {
    poll_fn(|cx| poll_send_to_peer(transport, cx, buf, peer)).await
}

/// A local or remote address of any of the supported transports
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}
impl Display for NetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetAddr::Inet(addr) => write!(f, "{}", addr),
            NetAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}
impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        NetAddr::Inet(addr)
    }
}
impl From<PathBuf> for NetAddr {
    fn from(path: PathBuf) -> Self {
        NetAddr::Unix(path)
    }
}

impl PacketTransport for UdpSocket {
    type Addr = SocketAddr;

    fn poll_recv_from(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<SocketAddr>> {
        UdpSocket::poll_recv_from(self, cx, buf)
    }

    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        UdpSocket::poll_recv(self, cx, buf)
    }

    fn poll_send_to(&self, cx: &mut Context<'_>, buf: &[u8], target: &SocketAddr) -> Poll<io::Result<usize>> {
        UdpSocket::poll_send_to(self, cx, buf, *target)
    }

    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        UdpSocket::poll_send(self, cx, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }
}

#[cfg(unix)]
pub use self::unix::unix_path;

#[cfg(unix)]
mod unix {
    use std::io;
    use std::path::PathBuf;
    use std::task::{ready, Context, Poll};

    use tokio::io::ReadBuf;
    use tokio::net::UnixDatagram;
    use tracing::debug;

    use super::PacketTransport;

    /// Unix datagram sockets are keyed by their bound path. Unnamed (unbound) senders can not be
    ///  replied to, so their datagrams are skipped.
    impl PacketTransport for UnixDatagram {
        type Addr = PathBuf;

        fn poll_recv_from(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<PathBuf>> {
            loop {
                let from = ready!(UnixDatagram::poll_recv_from(self, cx, buf))?;
                match from.as_pathname() {
                    Some(path) => return Poll::Ready(Ok(path.to_path_buf())),
                    None => {
                        debug!("skipping datagram from unnamed unix socket");
                        buf.clear();
                    }
                }
            }
        }

        fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            UnixDatagram::poll_recv(self, cx, buf)
        }

        fn poll_send_to(&self, cx: &mut Context<'_>, buf: &[u8], target: &PathBuf) -> Poll<io::Result<usize>> {
            UnixDatagram::poll_send_to(self, cx, buf, target)
        }

        fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            UnixDatagram::poll_send(self, cx, buf)
        }

        fn local_addr(&self) -> io::Result<PathBuf> {
            unix_path(UnixDatagram::local_addr(self)?)
        }

        fn peer_addr(&self) -> io::Result<PathBuf> {
            unix_path(UnixDatagram::peer_addr(self)?)
        }
    }

    pub fn unix_path(addr: tokio::net::unix::SocketAddr) -> io::Result<PathBuf> {
        addr.as_pathname()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "unix socket is not bound to a path"))
    }
}
