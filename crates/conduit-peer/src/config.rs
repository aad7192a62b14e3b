use std::net::SocketAddr;
use std::time::Duration;

use conduit_transport::{default_endpoint, loopback};

use crate::retry::{CancelToken, RetryPolicy};

/// Leader server behavior.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Relay a message back to the peer that sent it, too.
    pub echo_to_sender: bool,
    /// Per-peer write timeout. A peer that stops reading is dropped after this.
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Everything a [`Conduit`](crate::Conduit) needs besides its receiver.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    /// Shared endpoint all cooperating processes use.
    pub endpoint: SocketAddr,
    /// Backoff between connection attempts.
    pub retry: RetryPolicy,
    /// Settings for the leader server, should this process win the election.
    pub server: ServerConfig,
    /// Upper bound for a single client connect.
    pub connect_timeout: Duration,
    /// Cancels pending connection attempts when the embedder shuts down.
    pub cancel: CancelToken,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            retry: RetryPolicy::default(),
            server: ServerConfig::default(),
            connect_timeout: Duration::from_secs(2),
            cancel: CancelToken::new(),
        }
    }
}

impl ConduitConfig {
    /// Use the loopback interface on `port`.
    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint = loopback(port);
        self
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}
