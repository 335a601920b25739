use std::time::Duration;

use crate::error::PacketError;

/// largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// The receive loop waits until the session's reader has drained enough of the buffer. This
    ///  stalls *all* peers of the listener while one peer's buffer is full (head-of-line blocking)
    ///  but never loses data that made it to the socket.
    Block,
    /// A datagram that does not fit into the remaining buffer space is discarded as a whole.
    DropNewest,
}

#[derive(Debug, Clone)]
pub struct PacketConfig {
    /// Interval at which every open session sends an empty datagram to its peer. This keeps NAT
    ///  mappings and other stateful middleboxes alive, and doubles as a liveness signal.
    pub heartbeat_interval: Duration,

    /// Size of the scratch buffer used for reading a single datagram. Longer datagrams are
    ///  truncated by the socket.
    pub packet_size: usize,

    /// Capacity (in bytes) of each peer's receive buffer, i.e. how much data can be buffered
    ///  for a session before its reader catches up.
    pub buffer_size: usize,

    pub overflow: OverflowPolicy,
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            heartbeat_interval: Duration::from_secs(10),
            packet_size: 8192,
            buffer_size: 131072,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl PacketConfig {
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.heartbeat_interval.is_zero() {
            return Err(PacketError::InvalidConfig("heartbeat interval must be positive".to_string()));
        }
        if self.packet_size == 0 || self.packet_size > MAX_DATAGRAM_SIZE {
            return Err(PacketError::InvalidConfig(format!("packet size must be between 1 and {}, was {}", MAX_DATAGRAM_SIZE, self.packet_size)));
        }
        if self.buffer_size < self.packet_size {
            // otherwise a single maximum-size datagram could never be buffered
            return Err(PacketError::InvalidConfig(format!("buffer size {} is smaller than packet size {}", self.buffer_size, self.packet_size)));
        }
        Ok(())
    }
}
