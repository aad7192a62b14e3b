//! Loopback TCP transport for the conduit.
//!
//! All cooperating processes share one well-known `(host, port)` endpoint.
//! There is no registry and no broadcast discovery: whoever binds the port
//! first serves it, and everybody connects to it.
//!
//! This is the lowest layer of the conduit. Everything else builds on top of
//! [`ConduitStream`] and [`ConduitListener`].

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

pub use endpoint::{default_endpoint, loopback, DEFAULT_PORT};
pub use error::{Result, TransportError};
pub use stream::ConduitStream;
pub use tcp::ConduitListener;
