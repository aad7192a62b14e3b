use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use conduit_frame::{ConduitMessage, FrameConfig, MessageReader, MessageWriter};
use conduit_transport::ConduitStream;
use tracing::{debug, info, warn};

use crate::config::ConduitConfig;
use crate::dispatch::{Delivery, Dispatcher, MessageFilter};
use crate::error::{ConduitError, Result};
use crate::receiver::ConduitReceiver;
use crate::retry::CancelToken;
use crate::server::LeaderServer;
use crate::session::{read_until_closed, spawn_named};

/// Which side of the election this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the endpoint and relays for everyone, itself included.
    Leader,
    /// Connected to another process's leader server.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// A process's membership in the shared loopback conduit.
///
/// Construction elects a leader (whoever binds the endpoint first), connects
/// to it, and starts a reader thread that delivers matching messages to the
/// receiver. When the link drops, the next `send` or the reader reconnects,
/// which re-runs the election among whoever is still alive.
pub struct Conduit {
    shared: Arc<Shared>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: ConduitConfig,
    dispatcher: Dispatcher,
    link: Mutex<Link>,
    closed: AtomicBool,
    stop: CancelToken,
}

/// Current connection. Replaced wholesale on every reconnect.
#[derive(Default)]
struct Link {
    generation: u64,
    server: Option<LeaderServer>,
    writer: Option<MessageWriter<ConduitStream>>,
}

impl Link {
    fn teardown(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.get_ref().shutdown();
        }
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
    }

    fn reader_stream(&self) -> Result<ConduitStream> {
        let writer = self.writer.as_ref().ok_or(ConduitError::Closed)?;
        Ok(writer.get_ref().try_clone()?)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Conduit {
    /// Join the conduit on the default loopback endpoint.
    pub fn new(receiver: Arc<dyn ConduitReceiver>, delivery: Delivery) -> Result<Self> {
        Self::with_config(receiver, delivery, ConduitConfig::default())
    }

    /// Join the conduit described by `config`.
    ///
    /// Blocks until the first connection is up. Fails if the retry policy is
    /// exhausted or `config.cancel` fires first.
    pub fn with_config(
        receiver: Arc<dyn ConduitReceiver>,
        delivery: Delivery,
        config: ConduitConfig,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(receiver, delivery);
        let stop = config.cancel.child_token();
        let endpoint = config.endpoint;

        let shared = Arc::new(Shared {
            config,
            dispatcher,
            link: Mutex::new(Link::default()),
            closed: AtomicBool::new(false),
            stop,
        });

        let (generation, stream) = {
            let mut link = lock(&shared.link);
            shared.establish(&mut link)?;
            (link.generation, link.reader_stream()?)
        };

        let reader_shared = Arc::clone(&shared);
        let reader_thread = spawn_named(format!("conduit@{endpoint}"), move || {
            reader_shared.reader_loop(generation, stream)
        })?;

        Ok(Self {
            shared,
            reader_thread: Mutex::new(Some(reader_thread)),
        })
    }

    /// Send `message` to every member of the conduit.
    ///
    /// A broken link is replaced (fresh election) and the same message is
    /// written again on the new one.
    pub fn send(&self, message: &ConduitMessage) -> Result<()> {
        let mut link = lock(&self.shared.link);
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(ConduitError::Closed);
            }

            if let Some(writer) = link.writer.as_mut() {
                match writer.send(message) {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        let err = ConduitError::from(err);
                        if err.is_message_error() {
                            return Err(err);
                        }
                        debug!(error = %err, "conduit send failed; reconnecting");
                    }
                }
            }

            self.shared.establish(&mut link)?;
        }
    }

    pub fn role(&self) -> Role {
        if lock(&self.shared.link).server.is_some() {
            Role::Leader
        } else {
            Role::Client
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Peers connected to this process's leader server, if it is the leader.
    pub fn peer_count(&self) -> Option<usize> {
        lock(&self.shared.link)
            .server
            .as_ref()
            .map(LeaderServer::peer_count)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.shared.config.endpoint
    }

    /// Filter captured from the receiver at construction.
    pub fn filter(&self) -> &MessageFilter {
        self.shared.dispatcher.filter()
    }

    /// Token that aborts this conduit's pending reconnect attempts.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.stop.clone()
    }

    /// Leave the conduit: stop retrying, drop the link and any leader server,
    /// and wait for the reader thread.
    ///
    /// Safe to call more than once, and from inside a receiver callback.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.stop.cancel();
        lock(&self.shared.link).teardown();

        let reader_thread = lock(&self.reader_thread).take();
        if let Some(handle) = reader_thread {
            if handle.thread().id() == thread::current().id() {
                // Closed from a receiver callback; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                warn!(endpoint = %self.endpoint(), "conduit reader thread panicked");
            }
        }

        info!(endpoint = %self.endpoint(), "conduit closed");
    }
}

impl Drop for Conduit {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conduit")
            .field("endpoint", &self.endpoint())
            .field("role", &self.role())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Shared {
    /// Tear down the current link and run the election until connected.
    fn establish(&self, link: &mut Link) -> Result<()> {
        link.teardown();

        let endpoint = self.config.endpoint;
        let mut failures = 0u32;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConduitError::Closed);
            }
            if self.stop.is_cancelled() {
                return Err(ConduitError::Cancelled);
            }

            let server = match LeaderServer::bind(endpoint, self.config.server.clone()) {
                Ok(server) => Some(server),
                Err(err) if err.is_addr_in_use() => {
                    debug!(%endpoint, "endpoint already has a leader");
                    None
                }
                Err(err) => {
                    debug!(%endpoint, error = %err, "could not start leader server");
                    None
                }
            };

            match self.open_client() {
                Ok(writer) => {
                    let local = writer.get_ref().local_addr().ok();
                    link.generation += 1;
                    link.writer = Some(writer);
                    let role = if server.is_some() {
                        Role::Leader
                    } else {
                        Role::Client
                    };
                    link.server = server;
                    info!(
                        %endpoint,
                        %role,
                        generation = link.generation,
                        ?local,
                        "joined conduit"
                    );
                    return Ok(());
                }
                Err(err) => {
                    drop(server);
                    failures += 1;
                    if self.config.retry.is_exhausted(failures) {
                        warn!(
                            %endpoint,
                            attempts = failures,
                            error = %err,
                            "giving up on conduit"
                        );
                        return Err(ConduitError::RetriesExhausted {
                            endpoint,
                            attempts: failures,
                        });
                    }

                    let delay = self.config.retry.delay_for(failures);
                    debug!(
                        %endpoint,
                        attempt = failures,
                        ?delay,
                        error = %err,
                        "conduit connect failed"
                    );
                    if self.stop.wait(delay) {
                        return Err(if self.closed.load(Ordering::SeqCst) {
                            ConduitError::Closed
                        } else {
                            ConduitError::Cancelled
                        });
                    }
                }
            }
        }
    }

    fn open_client(&self) -> Result<MessageWriter<ConduitStream>> {
        let stream =
            ConduitStream::connect_timeout(self.config.endpoint, self.config.connect_timeout)?;
        let frame_config = FrameConfig {
            write_timeout: self.config.server.write_timeout,
        };
        Ok(MessageWriter::with_config_stream(stream, &frame_config)?)
    }

    fn reader_loop(self: &Arc<Self>, mut generation: u64, stream: ConduitStream) {
        let mut reader = Some(MessageReader::new(stream));
        loop {
            if let Some(active) = reader.as_mut() {
                let end = read_until_closed(active, |message| self.dispatcher.dispatch(message));
                debug!(generation, reason = %end, "conduit link lost");
            }
            reader = None;

            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match self.resume(generation) {
                Ok((next, stream)) => {
                    generation = next;
                    reader = Some(MessageReader::new(stream));
                }
                Err(ConduitError::Closed | ConduitError::Cancelled) => break,
                Err(err) => {
                    warn!(error = %err, "conduit reader could not reconnect");
                    if self.stop.wait(self.config.retry.max_delay) {
                        break;
                    }
                }
            }
        }
        debug!(endpoint = %self.config.endpoint, "conduit reader exited");
    }

    /// Get a stream for the link that replaced generation `observed`.
    ///
    /// Reconnects only if nobody else (a concurrent `send`) already did.
    fn resume(&self, observed: u64) -> Result<(u64, ConduitStream)> {
        let mut link = lock(&self.link);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConduitError::Closed);
        }
        if link.generation == observed || link.writer.is_none() {
            self.establish(&mut link)?;
        }
        let stream = link.reader_stream()?;
        Ok((link.generation, stream))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use conduit_frame::MARKER;
    use conduit_transport::{loopback, ConduitListener};

    use super::*;
    use crate::dispatch::event_queue;
    use crate::receiver::ChannelReceiver;
    use crate::retry::RetryPolicy;

    const RECV: Duration = Duration::from_secs(5);

    fn free_port() -> u16 {
        let listener = ConduitListener::bind(loopback(0)).unwrap();
        listener.local_addr().port()
    }

    fn fast_config(port: u16) -> ConduitConfig {
        ConduitConfig::default()
            .with_port(port)
            .with_retry(RetryPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
                multiplier: 2,
                max_attempts: None,
            })
    }

    fn join(port: u16) -> (Conduit, mpsc::Receiver<ConduitMessage>) {
        let (receiver, rx) = ChannelReceiver::new();
        let conduit =
            Conduit::with_config(Arc::new(receiver), Delivery::Inline, fast_config(port)).unwrap();
        (conduit, rx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + RECV;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn first_member_leads() {
        let port = free_port();
        let (leader, _rx) = join(port);
        let (client, _rx2) = join(port);

        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(client.role(), Role::Client);
        assert_eq!(client.peer_count(), None);
        wait_until(|| leader.peer_count() == Some(2));
    }

    #[test]
    fn concurrent_joins_elect_exactly_one_leader() {
        let port = free_port();
        let handles: Vec<_> = (0..4).map(|_| thread::spawn(move || join(port))).collect();
        let members: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let leaders = members.iter().filter(|(c, _)| c.is_leader()).count();
        assert_eq!(leaders, 1);
    }

    #[test]
    fn message_reaches_every_member_including_sender() {
        let port = free_port();
        let (a, a_rx) = join(port);
        let (_b, b_rx) = join(port);
        wait_until(|| a.peer_count() == Some(2));

        let msg = ConduitMessage::from_parts("ann", "R", "hello");
        a.send(&msg).unwrap();

        assert_eq!(b_rx.recv_timeout(RECV).unwrap(), msg);
        assert_eq!(a_rx.recv_timeout(RECV).unwrap(), msg);
    }

    #[test]
    fn malformed_frame_from_leader_triggers_reconnect() {
        let listener = ConduitListener::bind(loopback(0)).unwrap();
        let port = listener.local_addr().port();
        let (accepted_tx, accepted) = mpsc::channel();
        thread::spawn(move || {
            while let Ok(stream) = listener.accept() {
                if accepted_tx.send(stream).is_err() {
                    break;
                }
            }
        });

        let (conduit, rx) = join(port);
        assert_eq!(conduit.role(), Role::Client);

        let mut first = accepted.recv_timeout(RECV).unwrap();
        let mut garbage = MARKER.to_vec();
        garbage.extend_from_slice(&[0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, 0x00]);
        first.write_all(&garbage).unwrap();

        // The old link is still open on this side, so only the bad frame
        // can have caused the new connection.
        let mut second = MessageWriter::new(accepted.recv_timeout(RECV).unwrap());
        let msg = ConduitMessage::from_parts("ann", "R", "after garbage");
        second.send(&msg).unwrap();
        assert_eq!(rx.recv_timeout(RECV).unwrap(), msg);
    }

    #[test]
    fn id_filter_drops_other_routes() {
        let port = free_port();
        let (sender, _rx) = join(port);
        let (receiver, rx) = ChannelReceiver::new();
        let filtered = Conduit::with_config(
            Arc::new(receiver.with_id_filter("R")),
            Delivery::Inline,
            fast_config(port),
        )
        .unwrap();
        assert_eq!(filtered.filter().id.as_deref(), Some("R"));
        wait_until(|| sender.peer_count() == Some(2));

        sender.send(&ConduitMessage::from_parts("ann", "S", "skip")).unwrap();
        sender.send(&ConduitMessage::from_parts("ann", "R", "keep")).unwrap();

        assert_eq!(rx.recv_timeout(RECV).unwrap().payload(), "keep");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn survivor_takes_over_when_leader_leaves() {
        let port = free_port();
        let (leader, _rx) = join(port);
        let (b, _b_rx) = join(port);
        let (c, c_rx) = join(port);
        assert!(leader.is_leader());

        leader.close();
        wait_until(|| b.is_leader() || c.is_leader());

        let msg = ConduitMessage::from_parts("bob", "after", "failover");
        let deadline = Instant::now() + RECV;
        loop {
            b.send(&msg).unwrap();
            if c_rx.recv_timeout(Duration::from_millis(100)).is_ok_and(|m| m == msg) {
                break;
            }
            assert!(Instant::now() < deadline, "no delivery after failover");
        }
        assert!(b.is_leader() ^ c.is_leader());
    }

    #[test]
    fn queued_delivery_runs_on_draining_thread() {
        struct Record(Mutex<Vec<thread::ThreadId>>);
        impl ConduitReceiver for Record {
            fn message_received(&self, _message: &ConduitMessage) {
                self.0.lock().unwrap().push(thread::current().id());
            }
        }

        let port = free_port();
        let record = Arc::new(Record(Mutex::new(Vec::new())));
        let (delivery, queue) = event_queue();
        let conduit = Conduit::with_config(record.clone(), delivery, fast_config(port)).unwrap();

        conduit.send(&ConduitMessage::from_parts("ann", "R", "x")).unwrap();
        assert!(queue.dispatch_next(RECV));
        assert_eq!(*record.0.lock().unwrap(), vec![thread::current().id()]);
    }

    #[test]
    fn panicking_receiver_does_not_stop_reader() {
        struct Fragile(mpsc::Sender<String>);
        impl ConduitReceiver for Fragile {
            fn message_received(&self, message: &ConduitMessage) {
                if message.payload() == "boom" {
                    panic!("receiver failure");
                }
                let _ = self.0.send(message.payload().to_string());
            }
        }

        let port = free_port();
        let (tx, rx) = mpsc::channel();
        let conduit =
            Conduit::with_config(Arc::new(Fragile(tx)), Delivery::Inline, fast_config(port))
                .unwrap();

        conduit.send(&ConduitMessage::from_parts("ann", "R", "boom")).unwrap();
        conduit.send(&ConduitMessage::from_parts("ann", "R", "fine")).unwrap();
        assert_eq!(rx.recv_timeout(RECV).unwrap(), "fine");
    }

    #[test]
    fn client_send_survives_leader_exit() {
        let port = free_port();
        let (leader, _rx) = join(port);
        let (client, client_rx) = join(port);
        leader.close();

        let msg = ConduitMessage::from_parts("bob", "R", "still here");
        client.send(&msg).unwrap();
        let deadline = Instant::now() + RECV;
        loop {
            if client_rx.recv_timeout(Duration::from_millis(100)).is_ok_and(|m| m == msg) {
                break;
            }
            assert!(Instant::now() < deadline, "sender never saw its own message");
            client.send(&msg).unwrap();
        }
        assert!(client.is_leader());
    }

    #[test]
    fn oversized_message_is_rejected_without_reconnect() {
        let port = free_port();
        let (conduit, _rx) = join(port);

        let err = conduit
            .send(&ConduitMessage::from_parts("ann", "R", "x".repeat(70_000)))
            .unwrap_err();
        assert!(err.is_message_error());
        assert!(conduit.is_leader());
    }

    #[test]
    fn send_after_close_fails() {
        let port = free_port();
        let (conduit, _rx) = join(port);
        conduit.close();
        conduit.close();

        let err = conduit
            .send(&ConduitMessage::from_parts("ann", "R", "late"))
            .unwrap_err();
        assert!(matches!(err, ConduitError::Closed));
        assert!(!conduit.is_leader());
    }

    #[test]
    fn close_releases_endpoint() {
        let port = free_port();
        let (first, _rx) = join(port);
        first.close();

        let (second, _rx2) = join(port);
        assert!(second.is_leader());
    }

    #[test]
    fn cancelled_token_aborts_construction() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let (receiver, _rx) = ChannelReceiver::new();

        let err = Conduit::with_config(
            Arc::new(receiver),
            Delivery::Inline,
            fast_config(free_port()).with_cancel_token(cancel),
        )
        .unwrap_err();
        assert!(matches!(err, ConduitError::Cancelled));
    }

    #[test]
    fn bounded_policy_gives_up() {
        // Port 0 binds an ephemeral listener but can never be connected to.
        let config = fast_config(0).with_retry(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2,
            max_attempts: Some(2),
        });
        let (receiver, _rx) = ChannelReceiver::new();

        let err = Conduit::with_config(Arc::new(receiver), Delivery::Inline, config).unwrap_err();
        assert!(matches!(
            err,
            ConduitError::RetriesExhausted { attempts: 2, .. }
        ));
    }
}
