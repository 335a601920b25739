//! Entry points choosing between native connection-oriented transports, which are passed through
//!  unchanged, and datagram transports, which are wrapped in a [PacketListener] (or, on the
//!  client side, a connected [Session]).

use std::fmt::{Display, Formatter};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PacketConfig;
use crate::error::PacketError;
use crate::listener::PacketListener;
use crate::session::Session;
use crate::transport::{NetAddr, PacketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Udp,
    Udp4,
    Udp6,
    /// raw IP, optionally with a protocol suffix like `ip4:icmp`
    Ip,
    Ip4,
    Ip6,
    Unixgram,
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    /// datagram networks have no notion of a connection and are wrapped by this crate
    pub fn is_datagram(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6 | Network::Ip | Network::Ip4 | Network::Ip6 | Network::Unixgram)
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Udp4 | Network::Tcp4 | Network::Ip4 => addr.is_ipv4(),
            Network::Udp6 | Network::Tcp6 | Network::Ip6 => addr.is_ipv6(),
            _ => true,
        }
    }

    fn unspecified_host(self) -> &'static str {
        match self {
            Network::Udp6 | Network::Tcp6 | Network::Ip6 => "[::]",
            _ => "0.0.0.0",
        }
    }

    fn loopback_host(self) -> &'static str {
        match self {
            Network::Udp6 | Network::Tcp6 | Network::Ip6 => "[::1]",
            _ => "127.0.0.1",
        }
    }
}

impl FromStr for Network {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, protocol) = match s.split_once(':') {
            Some((name, protocol)) => (name, Some(protocol)),
            None => (s, None),
        };

        let network = match name {
            "udp" => Network::Udp,
            "udp4" => Network::Udp4,
            "udp6" => Network::Udp6,
            "ip" => Network::Ip,
            "ip4" => Network::Ip4,
            "ip6" => Network::Ip6,
            "unixgram" => Network::Unixgram,
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            "unix" => Network::Unix,
            _ => return Err(PacketError::UnknownNetwork(s.to_string())),
        };

        // only raw IP networks carry a protocol
        if protocol.is_some() && !matches!(network, Network::Ip | Network::Ip4 | Network::Ip6) {
            return Err(PacketError::UnknownNetwork(s.to_string()));
        }
        Ok(network)
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Ip => "ip",
            Network::Ip4 => "ip4",
            Network::Ip6 => "ip6",
            Network::Unixgram => "unixgram",
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
        };
        write!(f, "{}", name)
    }
}

/// A stream-oriented connection, either native or emulated on top of datagrams
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> io::Result<NetAddr>;
    fn peer_addr(&self) -> io::Result<NetAddr>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn Connection>, PacketError>;

    fn local_addr(&self) -> io::Result<NetAddr>;

    /// Pending and future calls to `accept()` fail with [PacketError::Closed]. Connections that
    ///  were already accepted stay open. Idempotent.
    fn close(&self);
}

impl<T: PacketTransport> Connection for Session<T> {
    fn local_addr(&self) -> io::Result<NetAddr> {
        Session::local_addr(self).map(Into::into)
    }

    fn peer_addr(&self) -> io::Result<NetAddr> {
        Session::peer_addr(self).map(Into::into)
    }
}

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<NetAddr> {
        TcpStream::local_addr(self).map(NetAddr::Inet)
    }

    fn peer_addr(&self) -> io::Result<NetAddr> {
        TcpStream::peer_addr(self).map(NetAddr::Inet)
    }
}

#[cfg(unix)]
impl Connection for tokio::net::UnixStream {
    fn local_addr(&self) -> io::Result<NetAddr> {
        crate::transport::unix_path(tokio::net::UnixStream::local_addr(self)?).map(NetAddr::Unix)
    }

    fn peer_addr(&self) -> io::Result<NetAddr> {
        crate::transport::unix_path(tokio::net::UnixStream::peer_addr(self)?).map(NetAddr::Unix)
    }
}

#[async_trait]
impl<T: PacketTransport> Listener for PacketListener<T> {
    async fn accept(&self) -> Result<Box<dyn Connection>, PacketError> {
        let session = PacketListener::accept(self).await?;
        Ok(Box::new(session))
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        PacketListener::local_addr(self).map(Into::into)
    }

    fn close(&self) {
        PacketListener::close(self)
    }
}

enum NativeSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}
impl NativeSocket {
    fn local_addr(&self) -> io::Result<NetAddr> {
        match self {
            NativeSocket::Tcp(listener) => listener.local_addr().map(NetAddr::Inet),
            #[cfg(unix)]
            NativeSocket::Unix(listener) => crate::transport::unix_path(listener.local_addr()?).map(NetAddr::Unix),
        }
    }

    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            NativeSocket::Tcp(listener) => {
                let (stream, from) = listener.accept().await?;
                debug!(?from, "accepted TCP connection");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            NativeSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("accepted unix stream connection");
                Ok(Box::new(stream))
            }
        }
    }
}

/// A natively connection-oriented listener, passed through unchanged except for making it
///  closeable through a shared reference. Closing drops the socket, so the OS stops accepting
///  connections on its behalf.
pub struct NativeListener {
    socket: Mutex<Option<Arc<NativeSocket>>>,
    local_addr: NetAddr,
    closed: CancellationToken,
}
impl NativeListener {
    fn new(socket: NativeSocket) -> io::Result<NativeListener> {
        Ok(NativeListener {
            local_addr: socket.local_addr()?,
            socket: Mutex::new(Some(Arc::new(socket))),
            closed: CancellationToken::new(),
        })
    }

    fn lock_socket(&self) -> MutexGuard<'_, Option<Arc<NativeSocket>>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Listener for NativeListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, PacketError> {
        // a pending accept holds the socket only until it sees the close signal
        let socket = self.lock_socket().clone();
        let socket = match socket {
            Some(socket) => socket,
            None => return Err(PacketError::Closed),
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(PacketError::Closed),
            r = socket.accept() => Ok(r?),
        }
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        Ok(self.local_addr.clone())
    }

    fn close(&self) {
        self.closed.cancel();
        if self.lock_socket().take().is_some() {
            info!(local_addr = %self.local_addr, "closed native listener");
        }
    }
}

/// Resolves `address` to the first socket address that belongs to the network's address family.
///  An address without a host part (`:port`) refers to `default_host`.
async fn resolve(network: Network, address: &str, default_host: &str) -> io::Result<SocketAddr> {
    let address = if address.starts_with(':') {
        format!("{}{}", default_host, address)
    }
    else {
        address.to_string()
    };

    let found = lookup_host(address.as_str()).await?
        .find(|addr| network.accepts(addr));
    found.ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no {} address for {}", network, address)))
}

/// Binds a listener on `address` with default settings, see [listen_with_config].
pub async fn listen(network: &str, address: &str) -> Result<Box<dyn Listener>, PacketError> {
    listen_with_config(network, address, PacketConfig::default()).await
}

/// Binds a listener for the given network (`udp`, `tcp6`, `unixgram`, ...) on `address`.
///
/// Datagram networks are wrapped in a [PacketListener] that emulates connections per peer
///  address. Connection-oriented networks are bound natively and returned as they are. Raw IP
///  networks are recognized but not supported.
pub async fn listen_with_config(network: &str, address: &str, config: PacketConfig) -> Result<Box<dyn Listener>, PacketError> {
    let kind: Network = network.parse()?;
    if kind.is_datagram() {
        config.validate()?;
    }
    let config = Arc::new(config);

    let bind_error = |source: io::Error| PacketError::Bind {
        network: network.to_string(),
        address: address.to_string(),
        source,
    };

    let listener: Box<dyn Listener> = match kind {
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            let addr = resolve(kind, address, kind.unspecified_host()).await.map_err(bind_error)?;
            let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
            Box::new(PacketListener::new(socket, config)?)
        }
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let addr = resolve(kind, address, kind.unspecified_host()).await.map_err(bind_error)?;
            let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
            Box::new(NativeListener::new(NativeSocket::Tcp(listener)).map_err(bind_error)?)
        }
        #[cfg(unix)]
        Network::Unixgram => {
            let socket = tokio::net::UnixDatagram::bind(address).map_err(bind_error)?;
            Box::new(PacketListener::new(socket, config)?)
        }
        #[cfg(unix)]
        Network::Unix => {
            let listener = tokio::net::UnixListener::bind(address).map_err(bind_error)?;
            Box::new(NativeListener::new(NativeSocket::Unix(listener)).map_err(bind_error)?)
        }
        #[cfg(not(unix))]
        Network::Unixgram | Network::Unix => return Err(PacketError::UnsupportedNetwork(network.to_string())),
        Network::Ip | Network::Ip4 | Network::Ip6 => return Err(PacketError::UnsupportedNetwork(network.to_string())),
    };

    info!(%kind, local_addr = ?listener.local_addr().ok(), "listener bound");
    Ok(listener)
}

/// Connects to `address` with default settings, see [dial_with_config].
pub async fn dial(network: &str, address: &str) -> Result<Box<dyn Connection>, PacketError> {
    dial_with_config(network, address, PacketConfig::default()).await
}

/// Connects to a listener. For UDP, this binds an ephemeral socket, connects it to `address`
///  and wraps it in a [Session] that owns the socket. Connection-oriented networks connect
///  natively.
pub async fn dial_with_config(network: &str, address: &str, config: PacketConfig) -> Result<Box<dyn Connection>, PacketError> {
    let kind: Network = network.parse()?;
    if kind.is_datagram() {
        config.validate()?;
    }

    let dial_error = |source: io::Error| PacketError::Dial {
        network: network.to_string(),
        address: address.to_string(),
        source,
    };

    match kind {
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            let remote = resolve(kind, address, kind.loopback_host()).await.map_err(dial_error)?;
            let local = if remote.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            }
            else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };

            let socket = UdpSocket::bind(local).await.map_err(dial_error)?;
            socket.connect(remote).await.map_err(dial_error)?;
            debug!(?remote, local = ?socket.local_addr().ok(), "connected datagram socket");
            Ok(Box::new(Session::connected(socket, Arc::new(config))))
        }
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let remote = resolve(kind, address, kind.loopback_host()).await.map_err(dial_error)?;
            let stream = TcpStream::connect(remote).await.map_err(dial_error)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(address).await.map_err(dial_error)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(PacketError::UnsupportedNetwork(network.to_string())),
        // an unnamed unix datagram socket could not receive replies, and raw IP is not available
        Network::Unixgram | Network::Ip | Network::Ip4 | Network::Ip6 => Err(PacketError::UnsupportedNetwork(network.to_string())),
    }
}
