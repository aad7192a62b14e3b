//! Filtering and delivery of decoded messages to the embedding receiver.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use conduit_frame::ConduitMessage;
use tracing::{debug, error, trace};

use crate::receiver::ConduitReceiver;

/// Sender/routing filter, fixed when the conduit is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub user: Option<String>,
    pub id: Option<String>,
}

impl MessageFilter {
    pub fn from_receiver(receiver: &dyn ConduitReceiver) -> Self {
        Self {
            user: receiver.user_filter(),
            id: receiver.id_filter(),
        }
    }

    pub fn accepts(&self, message: &ConduitMessage) -> bool {
        self.user.as_deref().is_none_or(|user| user == message.user())
            && self.id.as_deref().is_none_or(|id| id == message.id())
    }
}

/// Where the receiver runs.
pub enum Delivery {
    /// On the conduit's reader thread, synchronously.
    Inline,
    /// On whichever thread drains the paired [`EventQueue`].
    Queued(QueueHandle),
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Inline => f.write_str("Inline"),
            Delivery::Queued(_) => f.write_str("Queued"),
        }
    }
}

/// Sending half of an [`EventQueue`].
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Deferred>,
}

/// A delivery waiting to be run on the embedder's event thread.
pub struct Deferred {
    receiver: Arc<dyn ConduitReceiver>,
    message: ConduitMessage,
}

impl Deferred {
    pub fn message(&self) -> &ConduitMessage {
        &self.message
    }

    /// Hand the message to its receiver on the current thread.
    pub fn run(self) {
        invoke_guarded(self.receiver.as_ref(), &self.message);
    }
}

/// Queue of deferred deliveries, drained by the embedder's UI/event thread.
pub struct EventQueue {
    rx: mpsc::Receiver<Deferred>,
}

/// Create a queued [`Delivery`] and the queue it feeds.
pub fn event_queue() -> (Delivery, EventQueue) {
    let (tx, rx) = mpsc::channel();
    (Delivery::Queued(QueueHandle { tx }), EventQueue { rx })
}

impl EventQueue {
    /// Run every delivery already queued. Returns how many ran.
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(deferred) = self.rx.try_recv() {
            deferred.run();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one delivery and run it.
    pub fn dispatch_next(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(deferred) => {
                deferred.run();
                true
            }
            Err(_) => false,
        }
    }

    /// Take the next delivery without running it.
    pub fn try_next(&self) -> Option<Deferred> {
        self.rx.try_recv().ok()
    }
}

/// Applies the filter and delivery policy chosen at construction.
pub(crate) struct Dispatcher {
    filter: MessageFilter,
    delivery: Delivery,
    receiver: Arc<dyn ConduitReceiver>,
}

impl Dispatcher {
    pub(crate) fn new(receiver: Arc<dyn ConduitReceiver>, delivery: Delivery) -> Self {
        Self {
            filter: MessageFilter::from_receiver(receiver.as_ref()),
            delivery,
            receiver,
        }
    }

    pub(crate) fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    pub(crate) fn dispatch(&self, message: ConduitMessage) {
        if !self.filter.accepts(&message) {
            trace!(user = message.user(), id = message.id(), "filtered out message");
            return;
        }

        match &self.delivery {
            Delivery::Inline => invoke_guarded(self.receiver.as_ref(), &message),
            Delivery::Queued(queue) => {
                let deferred = Deferred {
                    receiver: Arc::clone(&self.receiver),
                    message,
                };
                if queue.tx.send(deferred).is_err() {
                    debug!("event queue dropped; discarding message");
                }
            }
        }
    }
}

/// Run the receiver, containing any panic so the reader keeps going.
pub(crate) fn invoke_guarded(receiver: &dyn ConduitReceiver, message: &ConduitMessage) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| receiver.message_received(message)));
    if let Err(panic) = outcome {
        error!(
            id = message.id(),
            panic = panic_text(panic.as_ref()),
            "conduit receiver panicked"
        );
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
