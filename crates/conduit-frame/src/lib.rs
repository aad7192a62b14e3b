//! Marker-synchronized message framing for the conduit.
//!
//! Every message is framed as:
//! - An 8-byte marker with no repeated byte values, for stream resynchronization
//! - Three strings (sender user, routing id, payload), each a 2-byte big-endian
//!   length followed by modified UTF-8 bytes
//!
//! Frames are written back-to-back with no other delimiter. A reader that
//! attaches mid-stream, or that has just skipped garbage, scans forward to the
//! next marker and carries on.

pub mod codec;
pub mod error;
pub mod message;
pub mod mutf8;
pub mod reader;
pub mod writer;

pub use codec::{encode_message, FrameConfig, MessageDecoder, MARKER, MAX_STRING_LEN};
pub use error::{FrameError, Result};
pub use message::{local_user, ConduitMessage};
pub use reader::MessageReader;
pub use writer::MessageWriter;
