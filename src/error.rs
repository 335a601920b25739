use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("failed to bind {network} socket to {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect {network} socket to {address}: {source}")]
    Dial {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// The listener or session was closed before or during the operation
    #[error("use of closed listener or session")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("network {0:?} is not supported")]
    UnsupportedNetwork(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PacketError {
    /// the error returned through [tokio::io::AsyncRead] / [tokio::io::AsyncWrite] when a session
    ///  is used after it was closed
    pub fn closed_io_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, PacketError::Closed)
    }

    /// checks whether an I/O error reports use of a closed session
    pub fn is_closed(e: &io::Error) -> bool {
        matches!(e.get_ref().and_then(|inner| inner.downcast_ref::<PacketError>()), Some(PacketError::Closed))
    }
}

impl From<PacketError> for io::Error {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::Transport(inner) => inner,
            PacketError::Closed => PacketError::closed_io_error(),
            other => {
                let kind = match &other {
                    PacketError::Bind { source, .. } | PacketError::Dial { source, .. } => source.kind(),
                    _ => io::ErrorKind::InvalidInput,
                };
                io::Error::new(kind, other)
            }
        }
    }
}
