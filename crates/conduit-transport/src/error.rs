use std::net::SocketAddr;

/// Errors that can occur in conduit transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when a bind failed because another socket already holds the address.
    ///
    /// For the conduit this is the normal outcome for every process except the
    /// one that won leadership.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            TransportError::Bind { source, .. }
                if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
