use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use conduit_frame::{encode_message, ConduitMessage, MessageReader, MessageWriter};
use conduit_transport::{ConduitListener, ConduitStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::session::{read_until_closed, spawn_named};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Relay server run by the process that owns the conduit endpoint.
///
/// Every message read from any connected peer is written to every connected
/// peer. Whether the originating peer gets its own message back is governed
/// by [`ServerConfig::echo_to_sender`].
pub struct LeaderServer {
    shared: Arc<ServerShared>,
    accept_thread: Option<JoinHandle<()>>,
}

struct ServerShared {
    addr: SocketAddr,
    config: ServerConfig,
    peers: Mutex<Vec<Arc<PeerHandle>>>,
    send_lock: Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_peer_id: AtomicU64,
    stopping: AtomicBool,
}

struct PeerHandle {
    id: u64,
    stream: ConduitStream,
    writer: Mutex<MessageWriter<ConduitStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LeaderServer {
    /// Bind the endpoint and start accepting peers.
    ///
    /// Fails with an error for which [`crate::ConduitError::is_addr_in_use`] is true
    /// when another process already leads on `addr`.
    pub fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        let listener = ConduitListener::bind(addr)?;
        let addr = listener.local_addr();
        let transport = listener.transport_name();

        let shared = Arc::new(ServerShared {
            addr,
            config,
            peers: Mutex::new(Vec::new()),
            send_lock: Mutex::new(()),
            workers: Mutex::new(Vec::new()),
            next_peer_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = spawn_named(format!("conduit-leader@{addr}"), move || {
            accept_shared.accept_loop(listener)
        })?;

        info!(%addr, transport, "elected conduit leader");

        Ok(Self {
            shared,
            accept_thread: Some(accept_thread),
        })
    }

    /// Send `message` to every connected peer. Returns how many received it.
    pub fn broadcast(&self, message: &ConduitMessage) -> Result<usize> {
        self.shared.broadcast(message, None)
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.shared.peers).len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Stop accepting, disconnect every peer and join all server threads.
    pub fn shutdown(&mut self) {
        let Some(accept_thread) = self.accept_thread.take() else {
            return;
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        if !accept_thread.is_finished() {
            // Unblock accept(); the loop sees the flag and exits.
            if let Err(err) = ConduitStream::connect_timeout(self.shared.addr, WAKE_TIMEOUT) {
                debug!(error = %err, "leader wake connection failed");
            }
        }
        if accept_thread.join().is_err() {
            warn!(addr = %self.shared.addr, "leader accept thread panicked");
        }

        self.shared.disconnect_all();
        let workers = std::mem::take(&mut *lock(&self.shared.workers));
        for worker in workers {
            if worker.join().is_err() {
                warn!(addr = %self.shared.addr, "peer thread panicked");
            }
        }

        info!(addr = %self.shared.addr, "conduit leader stopped");
    }
}

impl Drop for LeaderServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LeaderServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderServer")
            .field("addr", &self.shared.addr)
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl ServerShared {
    fn accept_loop(self: &Arc<Self>, listener: ConduitListener) {
        loop {
            let stream = match listener.accept() {
                Ok(stream) => stream,
                Err(err) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(addr = %self.addr, error = %err, "accept failed");
                    std::thread::sleep(ACCEPT_BACKOFF);
                    continue;
                }
            };

            if self.stopping.load(Ordering::SeqCst) {
                stream.shutdown();
                break;
            }

            if let Err(err) = self.admit(stream) {
                warn!(addr = %self.addr, error = %err, "failed to admit peer");
            }
        }

        self.disconnect_all();
        debug!(addr = %self.addr, "leader accept loop exited");
    }

    fn admit(self: &Arc<Self>, stream: ConduitStream) -> Result<()> {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let remote = stream.peer_addr()?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;
        writer_stream.set_write_timeout(self.config.write_timeout)?;

        let peer = Arc::new(PeerHandle {
            id,
            stream,
            writer: Mutex::new(MessageWriter::new(writer_stream)),
        });
        lock(&self.peers).push(Arc::clone(&peer));

        let shared = Arc::clone(self);
        let session_peer = Arc::clone(&peer);
        let spawned = spawn_named(format!("conduit-peer-{id}@{}", self.addr), move || {
            shared.serve_peer(&session_peer, reader_stream)
        });

        match spawned {
            Ok(handle) => {
                let mut workers = lock(&self.workers);
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
                debug!(peer = id, %remote, "peer joined");
                Ok(())
            }
            Err(err) => {
                self.drop_peer(id);
                Err(err)
            }
        }
    }

    fn serve_peer(self: &Arc<Self>, peer: &PeerHandle, stream: ConduitStream) {
        let exclude = (!self.config.echo_to_sender).then_some(peer.id);
        let mut reader = MessageReader::new(stream);

        let end = read_until_closed(&mut reader, |message| {
            if let Err(err) = self.broadcast(&message, exclude) {
                warn!(peer = peer.id, error = %err, "dropping unrelayable message");
            }
        });

        debug!(peer = peer.id, reason = %end, "peer session ended");
        self.drop_peer(peer.id);
    }

    fn broadcast(&self, message: &ConduitMessage, exclude: Option<u64>) -> Result<usize> {
        let _send = lock(&self.send_lock);
        // One encoding for every peer; an unencodable message reaches nobody.
        let mut frame = BytesMut::new();
        encode_message(message, &mut frame)?;

        let targets: Vec<Arc<PeerHandle>> = lock(&self.peers)
            .iter()
            .filter(|peer| Some(peer.id) != exclude)
            .cloned()
            .collect();

        let mut delivered = 0;
        for peer in &targets {
            match lock(&peer.writer).send_frame(&frame) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(peer = peer.id, error = %err, "dropping peer after failed write");
                    self.drop_peer(peer.id);
                }
            }
        }
        Ok(delivered)
    }

    fn drop_peer(&self, id: u64) {
        let removed = {
            let mut peers = lock(&self.peers);
            peers
                .iter()
                .position(|peer| peer.id == id)
                .map(|index| peers.remove(index))
        };
        if let Some(peer) = removed {
            peer.stream.shutdown();
            debug!(peer = id, "peer removed");
        }
    }

    fn disconnect_all(&self) {
        // Let an in-flight broadcast reach everyone before the sockets go.
        let _send = lock(&self.send_lock);
        let peers = std::mem::take(&mut *lock(&self.peers));
        for peer in peers {
            peer.stream.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use conduit_frame::{FrameError, MARKER};
    use conduit_transport::loopback;

    use super::*;

    fn start(echo_to_sender: bool) -> LeaderServer {
        let config = ServerConfig {
            echo_to_sender,
            ..ServerConfig::default()
        };
        LeaderServer::bind(loopback(0), config).unwrap()
    }

    type RawClient = (MessageReader<ConduitStream>, MessageWriter<ConduitStream>);

    fn client(server: &LeaderServer) -> RawClient {
        let stream = ConduitStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let writer = MessageWriter::new(stream.try_clone().unwrap());
        (MessageReader::new(stream), writer)
    }

    fn wait_for_peers(server: &LeaderServer, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.peer_count() != expected {
            assert!(Instant::now() < deadline, "peer count never reached {expected}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn relays_to_every_peer_including_sender() {
        let server = start(true);
        let mut clients: Vec<_> = (0..3).map(|_| client(&server)).collect();
        wait_for_peers(&server, 3);

        let msg = ConduitMessage::from_parts("ann", "R", "fan-out");
        clients[0].1.send(&msg).unwrap();

        for (reader, _) in &mut clients {
            assert_eq!(reader.read_message().unwrap(), msg);
        }
    }

    #[test]
    fn echo_disabled_skips_sender() {
        let server = start(false);
        let mut clients: Vec<_> = (0..2).map(|_| client(&server)).collect();
        wait_for_peers(&server, 2);

        let first = ConduitMessage::from_parts("ann", "R", "from-0");
        let second = ConduitMessage::from_parts("bob", "R", "from-1");
        clients[0].1.send(&first).unwrap();
        clients[1].1.send(&second).unwrap();

        assert_eq!(clients[1].0.read_message().unwrap(), first);
        // Client 0 never sees its own message; the next thing it reads is client 1's.
        assert_eq!(clients[0].0.read_message().unwrap(), second);
    }

    #[test]
    fn per_sender_order_is_preserved() {
        let server = start(true);
        let (_, mut sender) = client(&server);
        let (mut reader, _) = client(&server);
        wait_for_peers(&server, 2);

        for i in 0..20 {
            sender
                .send(&ConduitMessage::from_parts("ann", "seq", i.to_string()))
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(reader.read_message().unwrap().payload(), i.to_string());
        }
    }

    #[test]
    fn broadcast_reaches_connected_peers() {
        let server = start(true);
        let (mut reader, _writer) = client(&server);
        wait_for_peers(&server, 1);

        let msg = ConduitMessage::from_parts("leader", "notice", "hi");
        assert_eq!(server.broadcast(&msg).unwrap(), 1);
        assert_eq!(reader.read_message().unwrap(), msg);
    }

    #[test]
    fn disconnected_peer_is_removed() {
        let server = start(true);
        let (_keep_reader, _keep_writer) = client(&server);
        let gone = client(&server);
        wait_for_peers(&server, 2);

        gone.0.get_ref().shutdown();
        drop(gone);
        wait_for_peers(&server, 1);
    }

    #[test]
    fn malformed_frame_drops_only_that_peer() {
        let server = start(true);
        let (_bad_reader, mut bad) = client(&server);
        let (_, mut sender) = client(&server);
        let (mut receiver, _) = client(&server);
        wait_for_peers(&server, 3);

        let mut garbage = MARKER.to_vec();
        garbage.extend_from_slice(&[0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, 0x00]);
        bad.send_frame(&garbage).unwrap();
        wait_for_peers(&server, 2);

        let msg = ConduitMessage::from_parts("bob", "R", "still served");
        sender.send(&msg).unwrap();
        assert_eq!(receiver.read_message().unwrap(), msg);
    }

    #[test]
    fn unrelayable_field_is_rejected_at_the_reader() {
        let server = start(true);
        let (_bad_reader, mut bad) = client(&server);
        let (_, mut sender) = client(&server);
        let (mut receiver, _) = client(&server);
        wait_for_peers(&server, 3);

        // 64 000 bytes of 4-byte UTF-8; 96 000 once re-encoded.
        let payload = "\u{1F600}".repeat(16_000);
        let mut frame = MARKER.to_vec();
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload.as_bytes());
        bad.send_frame(&frame).unwrap();
        wait_for_peers(&server, 2);

        let msg = ConduitMessage::from_parts("bob", "R", "after oversized");
        sender.send(&msg).unwrap();
        assert_eq!(receiver.read_message().unwrap(), msg);
    }

    #[test]
    fn oversized_broadcast_reaches_nobody_and_keeps_peers() {
        let server = start(true);
        let (mut reader, _writer) = client(&server);
        wait_for_peers(&server, 1);

        let big = ConduitMessage::from_parts("leader", "big", "x".repeat(70_000));
        let err = server.broadcast(&big).unwrap_err();
        assert!(err.is_message_error());
        assert_eq!(server.peer_count(), 1);

        let msg = ConduitMessage::from_parts("leader", "small", "fits");
        assert_eq!(server.broadcast(&msg).unwrap(), 1);
        assert_eq!(reader.read_message().unwrap(), msg);
    }

    #[test]
    fn second_bind_reports_addr_in_use() {
        let server = start(true);
        let err = LeaderServer::bind(server.local_addr(), ServerConfig::default()).unwrap_err();
        assert!(err.is_addr_in_use());
    }

    #[test]
    fn shutdown_disconnects_peers_and_frees_port() {
        let mut server = start(true);
        let addr = server.local_addr();
        let (mut reader, _writer) = client(&server);
        wait_for_peers(&server, 1);

        server.shutdown();

        let err = reader.read_message().unwrap_err();
        assert!(matches!(
            err,
            FrameError::ConnectionClosed | FrameError::Io(_)
        ));
        assert_eq!(server.peer_count(), 0);

        let rebound = LeaderServer::bind(addr, ServerConfig::default()).unwrap();
        assert_eq!(rebound.local_addr(), addr);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut server = start(true);
        server.shutdown();
        server.shutdown();
    }
}
