//! Leader election, relay and process-level facade for the conduit.
//!
//! Every cooperating process builds one [`Conduit`]. The first to bind the
//! shared loopback endpoint runs a [`LeaderServer`] that relays each message
//! it receives to every connected member; all members, the leader included,
//! talk to that server as ordinary clients. If the leader goes away the
//! survivors reconnect, and the election simply runs again.

pub mod conduit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod receiver;
pub mod retry;
pub mod server;
mod session;

pub use conduit::{Conduit, Role};
pub use config::{ConduitConfig, ServerConfig};
pub use dispatch::{event_queue, Deferred, Delivery, EventQueue, MessageFilter, QueueHandle};
pub use error::{ConduitError, Result};
pub use receiver::{ChannelReceiver, ConduitReceiver};
pub use retry::{CancelToken, RetryPolicy};
pub use server::LeaderServer;
