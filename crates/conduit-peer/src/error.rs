use std::net::SocketAddr;

/// Errors that can occur in conduit peer operations.
///
/// Transient socket failures never reach callers of
/// [`Conduit::send`](crate::Conduit::send); they are turned into reconnects.
/// What remains is either terminal or a caller mistake.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] conduit_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] conduit_frame::FrameError),

    /// A worker thread could not be started.
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// The retry policy ran out of attempts before a connection was made.
    #[error("gave up connecting to {endpoint} after {attempts} attempts")]
    RetriesExhausted { endpoint: SocketAddr, attempts: u32 },

    /// A pending connection attempt was cancelled.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The conduit has been closed.
    #[error("conduit closed")]
    Closed,
}

impl ConduitError {
    /// True when a leader bind lost the race to another process.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ConduitError::Transport(err) if err.is_addr_in_use())
    }

    /// True for errors caused by the message itself rather than the link.
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            ConduitError::Frame(
                conduit_frame::FrameError::StringTooLong { .. }
                    | conduit_frame::FrameError::InvalidString { .. }
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, ConduitError>;
