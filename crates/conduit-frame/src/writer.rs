use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use conduit_transport::{ConduitStream, TransportError};

use crate::codec::{encode_message, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::ConduitMessage;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Writes complete messages to any `Write` stream.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> MessageWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Encode and write a complete message, then flush (blocking).
    ///
    /// A write timeout on the underlying stream surfaces as `FrameError::Io`
    /// with `WouldBlock` or `TimedOut`; it is not retried.
    pub fn send(&mut self, message: &ConduitMessage) -> Result<()> {
        self.buf.clear();
        encode_message(message, &mut self.buf)?;
        write_all(&mut self.inner, &self.buf)?;
        self.flush()
    }

    /// Write bytes already produced by [`encode_message`], then flush.
    ///
    /// Lets one encoding be shared across many writers.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        write_all(&mut self.inner, frame)?;
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl MessageWriter<ConduitStream> {
    /// Create a message writer for `ConduitStream` and apply write timeout from config.
    pub fn with_config_stream(inner: ConduitStream, config: &FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::new(inner))
    }
}

fn write_all<T: Write>(inner: &mut T, bytes: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match inner.write(&bytes[offset..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

fn transport_to_frame_error(err: TransportError) -> FrameError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
    }
}
