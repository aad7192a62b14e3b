//! Single-port message conduit between cooperating local processes.
//!
//! Every process joins the same loopback endpoint. Whoever binds it first
//! relays for everyone; when that process exits, the rest re-elect.
//!
//! # Crate Structure
//!
//! - [`transport`]: loopback TCP endpoint, listener and stream
//! - [`frame`]: marker-synchronized message codec and blocking reader/writer
//! - [`peer`]: leader server, receiver contract and the [`peer::Conduit`]
//!   facade (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use conduit_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use conduit_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use conduit_peer::*;
}
