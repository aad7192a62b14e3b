//! Per-connection plumbing shared by the leader server and the conduit facade.

use std::io::Read;
use std::thread::{self, JoinHandle};

use conduit_frame::{ConduitMessage, FrameError, MessageReader};
use tracing::{debug, warn};

use crate::error::ConduitError;

/// Feed every message read from `reader` to `sink` until the stream ends.
///
/// Returns the error that ended the session. A clean EOF or a local shutdown
/// comes back as [`FrameError::ConnectionClosed`].
pub(crate) fn read_until_closed<T, F>(reader: &mut MessageReader<T>, mut sink: F) -> FrameError
where
    T: Read,
    F: FnMut(ConduitMessage),
{
    loop {
        match reader.read_message() {
            Ok(message) => sink(message),
            Err(FrameError::ConnectionClosed) => {
                debug!("session closed by remote");
                return FrameError::ConnectionClosed;
            }
            Err(FrameError::Io(err)) if is_disconnect(&err) => {
                debug!(error = %err, "session disconnected");
                return FrameError::ConnectionClosed;
            }
            Err(err) => {
                warn!(error = %err, "session ended on read error");
                return err;
            }
        }
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// Start a named background thread.
pub(crate) fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>, ConduitError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| ConduitError::Spawn { name, source })
}
