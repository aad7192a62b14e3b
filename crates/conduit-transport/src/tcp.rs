use std::net::{SocketAddr, TcpListener};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::ConduitStream;

/// Listening side of a conduit endpoint.
///
/// Binding succeeds for exactly one process per endpoint at a time; that
/// process is the leader. Everyone else gets a [`TransportError::Bind`] for
/// which [`TransportError::is_addr_in_use`] is true.
pub struct ConduitListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ConduitListener {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(%addr, "listening on conduit endpoint");

        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<ConduitStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok(ConduitStream::from_tcp(stream))
    }

    /// The address this listener is actually bound to.
    ///
    /// Differs from the requested address when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp-loopback"
    }
}

impl std::fmt::Debug for ConduitListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitListener")
            .field("addr", &self.addr)
            .finish()
    }
}
