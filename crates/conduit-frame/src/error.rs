/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A string field did not contain well-formed modified UTF-8.
    #[error("malformed string in {field} field")]
    InvalidString { field: &'static str },

    /// A string field does not fit in its 2-byte length prefix.
    #[error("{field} field too long ({len} bytes, max {max})")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
