use std::sync::mpsc;

use conduit_frame::ConduitMessage;

/// Implemented by whatever wants the messages arriving through a conduit.
///
/// The filters are read exactly once, when the conduit is constructed and
/// before it starts receiving. `None` accepts any value.
pub trait ConduitReceiver: Send + Sync + 'static {
    /// Handle one delivered message.
    fn message_received(&self, message: &ConduitMessage);

    /// Only deliver messages sent by this user.
    fn user_filter(&self) -> Option<String> {
        None
    }

    /// Only deliver messages with this routing id.
    fn id_filter(&self) -> Option<String> {
        None
    }
}

/// Receiver that forwards every delivered message into a channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    tx: mpsc::Sender<ConduitMessage>,
    user_filter: Option<String>,
    id_filter: Option<String>,
}

impl ChannelReceiver {
    pub fn new() -> (Self, mpsc::Receiver<ConduitMessage>) {
        let (tx, rx) = mpsc::channel();
        let receiver = Self {
            tx,
            user_filter: None,
            id_filter: None,
        };
        (receiver, rx)
    }

    pub fn with_user_filter(mut self, user: impl Into<String>) -> Self {
        self.user_filter = Some(user.into());
        self
    }

    pub fn with_id_filter(mut self, id: impl Into<String>) -> Self {
        self.id_filter = Some(id.into());
        self
    }
}

impl ConduitReceiver for ChannelReceiver {
    fn message_received(&self, message: &ConduitMessage) {
        // A dropped channel just means nobody is listening any more.
        let _ = self.tx.send(message.clone());
    }

    fn user_filter(&self) -> Option<String> {
        self.user_filter.clone()
    }

    fn id_filter(&self) -> Option<String> {
        self.id_filter.clone()
    }
}
