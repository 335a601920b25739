use std::collections::hash_map::Entry;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::PacketConfig;
use crate::error::PacketError;
use crate::session::{is_transient, Session};
use crate::stream_buffer::StreamBuffer;
use crate::transport::{recv_from, PacketTransport};

/// A listener that turns a single datagram transport into a stream of per-peer [Session]s.
///
/// A background receive loop is the only reader of the transport. It demultiplexes incoming
///  datagrams by sender address, appending each payload to that peer's [StreamBuffer]. The first
///  datagram from a previously unknown address creates the buffer and hands the peer to a
///  publisher task, which offers a new session to [PacketListener::accept] callers in the order
///  peers were discovered. Waiting for an accept caller never blocks the receive loop.
///
/// Once an accepted session is closed, its peer is forgotten: the next datagram from the same
///  address creates a new session.
///
/// Closing the listener stops the receive loop and fails pending and future accepts, but leaves
///  sessions that were already accepted open. The listener itself holds no reference to the
///  transport: it is owned by the background tasks and the sessions, and it is closed once the
///  last of them is gone.
pub struct PacketListener<T: PacketTransport> {
    shared: Arc<Shared<T>>,
    local_addr: T::Addr,
    accept: tokio::sync::Mutex<mpsc::Receiver<Session<T>>>,
}

struct Shared<T: PacketTransport> {
    config: Arc<PacketConfig>,
    /// each peer's receive buffer, keyed by peer address. The lock is never held across an await.
    open: Mutex<FxHashMap<T::Addr, Arc<StreamBuffer>>>,
    closed: CancellationToken,
    /// fired when the receive loop ended because of a fatal transport error
    failed: CancellationToken,
}

impl<T: PacketTransport> Shared<T> {
    fn lock_open(&self) -> MutexGuard<'_, FxHashMap<T::Addr, Arc<StreamBuffer>>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// returns the peer's buffer, and whether it was newly created
    fn peer_buffer(&self, peer: &T::Addr) -> (Arc<StreamBuffer>, bool) {
        match self.lock_open().entry(peer.clone()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let buffer = Arc::new(StreamBuffer::new(self.config.buffer_size));
                e.insert(buffer.clone());
                (buffer, true)
            }
        }
    }
}

impl<T: PacketTransport> PacketListener<T> {
    /// Takes ownership of a bound datagram transport and starts receiving on it. Must be called
    ///  from inside a tokio runtime.
    pub fn new(transport: T, config: Arc<PacketConfig>) -> Result<PacketListener<T>, PacketError> {
        config.validate()?;

        let local_addr = transport.local_addr()?;
        let transport = Arc::new(transport);
        let shared = Arc::new(Shared {
            config,
            open: Default::default(),
            closed: CancellationToken::new(),
            failed: CancellationToken::new(),
        });
        info!(?local_addr, "listening for datagrams");

        // an unbounded queue keeps the receive loop from ever waiting for the publisher
        let (discovered_send, discovered_recv) = mpsc::unbounded_channel();
        // capacity 1 is the closest tokio gets to a rendezvous channel
        let (accept_send, accept_recv) = mpsc::channel(1);

        tokio::spawn(recv_loop(shared.clone(), transport.clone(), discovered_send));
        tokio::spawn(publish_loop(shared.clone(), transport, discovered_recv, accept_send));

        Ok(PacketListener {
            shared,
            local_addr,
            accept: tokio::sync::Mutex::new(accept_recv),
        })
    }

    /// Waits for the next new peer. Fails with [PacketError::Closed] once the listener is
    ///  closed, or after the receive loop terminated and all discovered peers were accepted.
    pub async fn accept(&self) -> Result<Session<T>, PacketError> {
        if self.shared.closed.is_cancelled() {
            return Err(PacketError::Closed);
        }

        let accepted = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => None,
            session = async { self.accept.lock().await.recv().await } => session,
        };

        match accepted {
            Some(session) => {
                debug!(peer = ?session.peer_addr().ok(), "accepted session");
                Ok(session)
            }
            None => {
                self.discard_unaccepted();
                Err(PacketError::Closed)
            }
        }
    }

    /// the address the transport was bound to, also after the listener was closed
    pub fn local_addr(&self) -> io::Result<T::Addr> {
        Ok(self.local_addr.clone())
    }

    /// number of peers with an entry in the demultiplexing table
    pub fn peer_count(&self) -> usize {
        self.shared.lock_open().len()
    }

    /// `true` once the listener was closed or its transport failed. After a failure, peers that
    ///  were discovered before it can still be accepted.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled() || self.shared.failed.is_cancelled()
    }

    /// Stops the receive loop and makes pending and future calls to `accept()` fail. Sessions that
    ///  were already accepted are not affected. Calling this more than once has no effect.
    ///
    /// The background tasks release the transport as soon as they observe the close, so the
    ///  socket is closed shortly afterwards unless accepted sessions are still using it.
    pub fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        info!(local_addr = ?self.local_addr, "closing listener");
        self.shared.closed.cancel();
        self.discard_unaccepted();
    }

    /// drops (and thereby closes) sessions that were published but never accepted
    fn discard_unaccepted(&self) {
        if let Ok(mut accept) = self.accept.try_lock() {
            accept.close();
            while let Ok(session) = accept.try_recv() {
                trace!(peer = ?session.peer_addr().ok(), "discarding session that was never accepted");
            }
        }
    }
}

impl PacketListener<UdpSocket> {
    /// Binds a UDP socket to `addr` and listens on it.
    pub async fn bind(addr: SocketAddr, config: Arc<PacketConfig>) -> Result<PacketListener<UdpSocket>, PacketError> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await
            .map_err(|source| PacketError::Bind {
                network: "udp".to_string(),
                address: addr.to_string(),
                source,
            })?;
        PacketListener::new(socket, config)
    }
}

impl<T: PacketTransport> Drop for PacketListener<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn recv_loop<T: PacketTransport>(shared: Arc<Shared<T>>, transport: Arc<T>, discovered: mpsc::UnboundedSender<(T::Addr, Arc<StreamBuffer>)>) {
    trace!("starting datagram receive loop");

    let mut scratch = vec![0u8; shared.config.packet_size];
    loop {
        let (num_read, from) = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            r = recv_from(transport.as_ref(), &mut scratch) => match r {
                Ok(x) => x,
                Err(e) if is_transient(&e) => {
                    debug!(error = ?e, "transient error receiving from datagram socket - ignoring");
                    continue;
                }
                Err(e) => {
                    error!(error = ?e, "error receiving from datagram socket - no further peers will be accepted");
                    shared.failed.cancel();
                    break;
                }
            }
        };
        trace!(?from, "received datagram of {} bytes", num_read);

        let (buffer, is_new) = shared.peer_buffer(&from);

        // NB: with OverflowPolicy::Block, a full buffer stalls this loop for all peers
        let delivered = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            r = buffer.deliver(&scratch[..num_read], shared.config.overflow) => r,
        };
        match delivered {
            Ok(true) => {}
            Ok(false) => warn!(?from, "receive buffer full - dropping datagram of {} bytes", num_read),
            Err(_) => trace!(?from, "session is closed - dropping datagram"),
        }

        if is_new {
            debug!(?from, "new peer");
            if discovered.send((from, buffer)).is_err() {
                break;
            }
        }
    }

    trace!("datagram receive loop ended");
}

async fn publish_loop<T: PacketTransport>(
    shared: Arc<Shared<T>>,
    transport: Arc<T>,
    mut discovered: mpsc::UnboundedReceiver<(T::Addr, Arc<StreamBuffer>)>,
    accept: mpsc::Sender<Session<T>>,
) {
    loop {
        let (peer, buffer) = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = discovered.recv() => match next {
                Some(x) => x,
                None => break,
            }
        };

        let session = Session::for_peer(transport.clone(), peer.clone(), buffer, &shared.config);
        let session_closed = session.closed_token();

        // if the listener is closed first, the session is dropped (and closed) unpublished
        let offered = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            r = accept.send(session) => r,
        };
        if offered.is_err() {
            break;
        }

        tokio::spawn(release_on_close(shared.clone(), peer, session_closed));
    }

    trace!("session publisher ended");
}

async fn release_on_close<T: PacketTransport>(shared: Arc<Shared<T>>, peer: T::Addr, session_closed: CancellationToken) {
    tokio::select! {
        biased;
        _ = shared.closed.cancelled() => {}
        _ = session_closed.cancelled() => {
            debug!(?peer, "session closed - releasing peer");
            shared.lock_open().remove(&peer);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use crate::config::OverflowPolicy;
    use crate::test_util::{test_addr_from_number, TrackingTransport};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn udp_listener(config: PacketConfig) -> (PacketListener<UdpSocket>, SocketAddr) {
        let listener = PacketListener::bind(test_addr_from_number(0), Arc::new(config)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn accept<T: PacketTransport>(listener: &PacketListener<T>) -> Session<T> {
        timeout(TIMEOUT, listener.accept()).await.unwrap().unwrap()
    }

    async fn read_n<S: AsyncRead + Unpin>(session: &mut S, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        timeout(TIMEOUT, session.read_exact(&mut buf)).await.unwrap().unwrap();
        buf
    }

    fn small_buffer_config(overflow: OverflowPolicy) -> PacketConfig {
        PacketConfig {
            heartbeat_interval: Duration::from_secs(10),
            packet_size: 8,
            buffer_size: 8,
            overflow,
        }
    }

    #[tokio::test]
    async fn test_two_peers_are_demultiplexed_in_discovery_order() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let a = client().await;
        let b = client().await;

        a.send_to(b"hello-A", addr).await.unwrap();
        b.send_to(b"hello-B", addr).await.unwrap();
        a.send_to(b"again-A", addr).await.unwrap();

        let mut session_a = accept(&listener).await;
        let mut session_b = accept(&listener).await;
        assert_eq!(session_a.peer_addr().unwrap(), a.local_addr().unwrap());
        assert_eq!(session_b.peer_addr().unwrap(), b.local_addr().unwrap());
        assert_eq!(session_a.local_addr().unwrap(), addr);

        assert_eq!(read_n(&mut session_a, 14).await, b"hello-Aagain-A");
        assert_eq!(read_n(&mut session_b, 7).await, b"hello-B");
    }

    #[tokio::test]
    async fn test_interleaved_senders_never_mix() {
        const NUM_PEERS: usize = 5;
        const NUM_DATAGRAMS: usize = 20;

        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let mut clients = Vec::new();
        for _ in 0..NUM_PEERS {
            clients.push(client().await);
        }

        for i in 0..NUM_DATAGRAMS {
            for (peer, c) in clients.iter().enumerate() {
                c.send_to(format!("[{}:{:02}]", peer, i).as_bytes(), addr).await.unwrap();
            }
        }

        // sessions stay open until the end, dropping one would release its peer
        let mut sessions = Vec::new();
        for (peer, c) in clients.iter().enumerate() {
            let mut session = accept(&listener).await;
            assert_eq!(session.peer_addr().unwrap(), c.local_addr().unwrap());

            let expected = (0..NUM_DATAGRAMS)
                .map(|i| format!("[{}:{:02}]", peer, i))
                .collect::<String>();
            assert_eq!(read_n(&mut session, expected.len()).await, expected.as_bytes());
            sessions.push(session);
        }
        assert_eq!(listener.peer_count(), NUM_PEERS);
    }

    #[tokio::test]
    async fn test_one_session_per_peer() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let a = client().await;
        for _ in 0..3 {
            a.send_to(b"x", addr).await.unwrap();
        }

        let mut session = accept(&listener).await;
        assert_eq!(read_n(&mut session, 3).await, b"xxx");

        assert!(timeout(Duration::from_millis(100), listener.accept()).await.is_err());
        assert_eq!(listener.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_session_writes_reach_peer() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let a = client().await;
        a.send_to(b"ping", addr).await.unwrap();

        let mut session = accept(&listener).await;
        session.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = timeout(TIMEOUT, a.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, addr);
    }

    #[tokio::test]
    async fn test_idle_session_sends_heartbeats() {
        let (listener, addr) = udp_listener(PacketConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..PacketConfig::default()
        }).await;
        let a = client().await;
        a.send_to(b"hi", addr).await.unwrap();
        let _session = accept(&listener).await;

        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let (n, from) = timeout(TIMEOUT, a.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(n, 0);
            assert_eq!(from, addr);
        }
    }

    #[tokio::test]
    async fn test_close_listener_fails_accept_but_keeps_sessions() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let a = client().await;
        a.send_to(b"hi", addr).await.unwrap();
        let mut session = accept(&listener).await;

        listener.close();
        listener.close();
        assert!(listener.is_closed());
        assert!(matches!(listener.accept().await, Err(PacketError::Closed)));

        session.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = timeout(TIMEOUT, a.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let (listener, _) = udp_listener(PacketConfig::default()).await;
        let listener = Arc::new(listener);

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move {
                listener.accept().await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        listener.close();
        let result = timeout(TIMEOUT, pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(PacketError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_session_releases_peer() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let a = client().await;
        a.send_to(b"first", addr).await.unwrap();

        let session = accept(&listener).await;
        assert_eq!(listener.peer_count(), 1);
        session.close();

        timeout(TIMEOUT, async {
            while listener.peer_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        a.send_to(b"second", addr).await.unwrap();
        let mut session = accept(&listener).await;
        assert_eq!(session.peer_addr().unwrap(), a.local_addr().unwrap());
        assert_eq!(read_n(&mut session, 6).await, b"second");
    }

    #[tokio::test]
    async fn test_receive_error_ends_accepting() {
        let (transport, inbound) = TrackingTransport::new(test_addr_from_number(1));
        let listener = PacketListener::new(transport, Arc::new(PacketConfig::default())).unwrap();

        inbound.send(Ok((test_addr_from_number(2), b"before".to_vec()))).unwrap();
        drop(inbound);

        wait_until_closed(&listener).await;

        // peers discovered before the failure are still published
        let mut session = accept(&listener).await;
        assert_eq!(read_n(&mut session, 6).await, b"before");

        let result = timeout(TIMEOUT, listener.accept()).await.unwrap();
        assert!(matches!(result, Err(PacketError::Closed)));
    }

    async fn wait_until_closed<T: PacketTransport>(listener: &PacketListener<T>) {
        timeout(TIMEOUT, async {
            while !listener.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[rstest]
    #[case::connection_reset(io::ErrorKind::ConnectionReset)]
    #[case::connection_refused(io::ErrorKind::ConnectionRefused)]
    #[tokio::test]
    async fn test_transient_receive_errors_are_skipped(#[case] kind: io::ErrorKind) {
        let (transport, inbound) = TrackingTransport::new(test_addr_from_number(1));
        let listener = PacketListener::new(transport, Arc::new(PacketConfig::default())).unwrap();

        inbound.send(Err(io::Error::from(kind))).unwrap();
        inbound.send(Err(io::Error::from(kind))).unwrap();
        inbound.send(Ok((test_addr_from_number(2), b"after".to_vec()))).unwrap();

        let mut session = accept(&listener).await;
        assert_eq!(session.peer_addr().unwrap(), test_addr_from_number(2));
        assert_eq!(read_n(&mut session, 5).await, b"after");
        assert!(!listener.is_closed());
    }

    #[tokio::test]
    async fn test_other_receive_errors_are_fatal() {
        let (transport, inbound) = TrackingTransport::new(test_addr_from_number(1));
        let listener = PacketListener::new(transport, Arc::new(PacketConfig::default())).unwrap();

        inbound.send(Err(io::Error::from(io::ErrorKind::PermissionDenied))).unwrap();
        wait_until_closed(&listener).await;

        // the receive loop is gone, later datagrams are never seen
        let _ = inbound.send(Ok((test_addr_from_number(2), b"too late".to_vec())));
        let result = timeout(TIMEOUT, listener.accept()).await.unwrap();
        assert!(matches!(result, Err(PacketError::Closed)));
        assert_eq!(listener.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        listener.close();

        // the background tasks drop the socket once they observe the close
        let rebound = timeout(TIMEOUT, async {
            loop {
                match UdpSocket::bind(addr).await {
                    Ok(socket) => break socket,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        }).await.unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_accepted_session_keeps_socket_after_close() {
        let (listener, addr) = udp_listener(PacketConfig::default()).await;
        let a = client().await;
        a.send_to(b"hi", addr).await.unwrap();
        let session = accept(&listener).await;

        listener.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(UdpSocket::bind(addr).await.unwrap_err().kind(), io::ErrorKind::AddrInUse);

        drop(session);
        timeout(TIMEOUT, async {
            while UdpSocket::bind(addr).await.is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_newest_discards_datagrams_that_do_not_fit() {
        let (transport, inbound) = TrackingTransport::new(test_addr_from_number(1));
        let listener = PacketListener::new(transport, Arc::new(small_buffer_config(OverflowPolicy::DropNewest))).unwrap();

        inbound.send(Ok((test_addr_from_number(2), b"12345".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(2), b"67890".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(2), b"abc".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(3), b"other".to_vec()))).unwrap();

        let mut first = accept(&listener).await;
        let _second = accept(&listener).await;

        // discovery of the second peer implies all of the first peer's datagrams were processed
        assert_eq!(read_n(&mut first, 8).await, b"12345abc");
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_receive_loop() {
        let (transport, inbound) = TrackingTransport::new(test_addr_from_number(1));
        let listener = PacketListener::new(transport, Arc::new(small_buffer_config(OverflowPolicy::Block))).unwrap();

        inbound.send(Ok((test_addr_from_number(2), b"12345".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(2), b"67890".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(3), b"other".to_vec()))).unwrap();

        let mut first = accept(&listener).await;

        // head-of-line blocking: the second peer is not discovered while the first peer's buffer is full
        assert!(timeout(Duration::from_millis(100), listener.accept()).await.is_err());

        assert_eq!(read_n(&mut first, 10).await, b"1234567890");
        let mut second = accept(&listener).await;
        assert_eq!(read_n(&mut second, 5).await, b"other");
    }

    #[tokio::test]
    async fn test_closing_blocked_session_unblocks_receive_loop() {
        let (transport, inbound) = TrackingTransport::new(test_addr_from_number(1));
        let listener = PacketListener::new(transport, Arc::new(small_buffer_config(OverflowPolicy::Block))).unwrap();

        inbound.send(Ok((test_addr_from_number(2), b"12345".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(2), b"67890".to_vec()))).unwrap();
        inbound.send(Ok((test_addr_from_number(3), b"other".to_vec()))).unwrap();

        let first = accept(&listener).await;
        first.close();

        let mut second = accept(&listener).await;
        assert_eq!(second.peer_addr().unwrap(), test_addr_from_number(3));
        assert_eq!(read_n(&mut second, 5).await, b"other");
    }

    #[tokio::test]
    async fn test_bind_occupied_address_fails() {
        let (_listener, addr) = udp_listener(PacketConfig::default()).await;
        match PacketListener::bind(addr, Arc::new(PacketConfig::default())).await {
            Err(PacketError::Bind { source, .. }) => assert_eq!(source.kind(), io::ErrorKind::AddrInUse),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bound an occupied address"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (transport, _inbound) = TrackingTransport::new(test_addr_from_number(1));
        let config = PacketConfig {
            packet_size: 0,
            ..PacketConfig::default()
        };
        assert!(matches!(PacketListener::new(transport, Arc::new(config)), Err(PacketError::InvalidConfig(_))));
    }
}
