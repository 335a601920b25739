//! Connection-style listeners on top of datagram transports. Datagrams from each distinct peer
//!  address are demultiplexed into a per-peer [session::Session] that behaves like a byte stream,
//!  and a periodic heartbeat keeps NAT and firewall mappings alive. Connection-oriented networks
//!  are passed through unchanged, see [dispatch::listen].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod session;
pub mod stream_buffer;
pub mod transport;
pub mod test_util;

pub use config::{OverflowPolicy, PacketConfig};
pub use dispatch::{dial, dial_with_config, listen, listen_with_config, Connection, Listener, Network};
pub use error::PacketError;
pub use listener::PacketListener;
pub use session::Session;
pub use transport::{NetAddr, PacketTransport};
