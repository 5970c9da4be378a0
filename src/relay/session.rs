use std::io::ErrorKind;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FullQueuePolicy, RelaySettings};
use crate::error::{Error, Result};
use crate::relay::heartbeat::{self, Probe};
use crate::relay::queue::{PacketQueue, Push};
use crate::relay::registry::RegistryHandle;
use crate::relay::{ConnectionId, READ_BUFFER_SIZE};

const CONNECTING: u8 = 0;
const ACTIVE: u8 = 1;
const FREEING: u8 = 2;
const FREED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Active,
    Freeing,
    Freed,
}

impl Lifecycle {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CONNECTING => Lifecycle::Connecting,
            ACTIVE => Lifecycle::Active,
            FREEING => Lifecycle::Freeing,
            _ => Lifecycle::Freed,
        }
    }
}

/// One client/target pairing.
///
/// Four tasks run per active session: the target reader, the two queue
/// forwarders and the heartbeat. All of them stop when [`free`] runs, which
/// is the single teardown entry point and may be called from any of them.
///
/// [`free`]: RelaySession::free
pub struct RelaySession {
    id: ConnectionId,
    connected_at: Instant,
    settings: RelaySettings,
    registry: RegistryHandle,
    state: AtomicU8,
    to_target: PacketQueue,
    to_client: PacketQueue,
    /// Duplicate handle on the target socket, used to shut it down from
    /// `free` while the halves are owned by the I/O tasks.
    target: Mutex<Option<std::net::TcpStream>>,
    target_connected: AtomicBool,
    last_target_packet_at: Mutex<Option<Instant>>,
    last_client_packet_at: Mutex<Option<Instant>>,
    bytes_to_target: AtomicU64,
    bytes_to_client: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelaySession {
    pub fn new(id: ConnectionId, registry: RegistryHandle, settings: RelaySettings) -> Arc<Self> {
        debug!(conn = id, "initializing session");
        Arc::new(Self {
            id,
            connected_at: Instant::now(),
            to_target: PacketQueue::new(settings.queue_capacity),
            to_client: PacketQueue::new(settings.queue_capacity),
            settings,
            registry,
            state: AtomicU8::new(CONNECTING),
            target: Mutex::new(None),
            target_connected: AtomicBool::new(false),
            last_target_packet_at: Mutex::new(None),
            last_client_packet_at: Mutex::new(None),
            bytes_to_target: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Connecting or active; false once teardown has started.
    fn is_live(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), CONNECTING | ACTIVE)
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn is_target_connected(&self) -> bool {
        self.target_connected.load(Ordering::Acquire)
    }

    pub fn last_target_packet_at(&self) -> Option<Instant> {
        *lock(&self.last_target_packet_at)
    }

    pub fn last_client_packet_at(&self) -> Option<Instant> {
        *lock(&self.last_client_packet_at)
    }

    /// Bytes written so far as `(to_target, to_client)`.
    pub fn bytes_forwarded(&self) -> (u64, u64) {
        (
            self.bytes_to_target.load(Ordering::Relaxed),
            self.bytes_to_client.load(Ordering::Relaxed),
        )
    }

    /// Number of session tasks that have been spawned and not yet finished.
    pub fn running_tasks(&self) -> usize {
        lock(&self.tasks).iter().filter(|task| !task.is_finished()).count()
    }

    pub fn client_queue(&self) -> &PacketQueue {
        &self.to_target
    }

    pub fn target_queue(&self) -> &PacketQueue {
        &self.to_client
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn probe(&self) -> Probe {
        let now = Instant::now();
        Probe {
            alive_for: now.saturating_duration_since(self.connected_at),
            registered: self.registry.is_registered(self.id),
            target_connected: self.is_target_connected(),
            since_target_packet: self
                .last_target_packet_at()
                .map(|at| now.saturating_duration_since(at)),
            since_client_packet: self
                .last_client_packet_at()
                .map(|at| now.saturating_duration_since(at)),
        }
    }

    /// Dial the target and start relaying.
    ///
    /// A failed or timed-out dial frees the session before any task is
    /// spawned and returns the dial error.
    pub async fn start(self: &Arc<Self>, target_addr: &str) -> Result<()> {
        info!(conn = self.id, target = %target_addr, "connecting to target");

        let dial = timeout(self.settings.connect_timeout, TcpStream::connect(target_addr)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                error!(conn = self.id, target = %target_addr, error = %source, "target connection failed");
                self.free();
                return Err(Error::Dial {
                    target: target_addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                error!(conn = self.id, target = %target_addr, "target connection timed out");
                self.free();
                return Err(Error::DialTimeout {
                    target: target_addr.to_string(),
                    timeout: self.settings.connect_timeout,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(conn = self.id, error = %e, "failed to set TCP_NODELAY on target socket");
        }

        let (stream, control) = match detach_control(stream) {
            Ok(pair) => pair,
            Err(e) => {
                error!(conn = self.id, error = %e, "failed to prepare target socket");
                self.free();
                return Err(e.into());
            }
        };

        // Held until the tasks are recorded so a concurrent `free` either
        // stops this from activating or sees everything it has to stop.
        let mut target = lock(&self.target);
        if self
            .state
            .compare_exchange(CONNECTING, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(conn = self.id, "session freed while dialing, dropping target connection");
            return Err(Error::ConnectionClosed(self.id));
        }
        *target = Some(control);
        self.target_connected.store(true, Ordering::Release);
        info!(conn = self.id, target = %target_addr, "target connection established");

        let (reader, writer) = stream.into_split();
        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(heartbeat::monitor(Arc::clone(self))));
        tasks.push(tokio::spawn(Arc::clone(self).read_target(reader)));
        tasks.push(tokio::spawn(Arc::clone(self).forward_to_target(writer)));
        tasks.push(tokio::spawn(Arc::clone(self).forward_to_client()));

        Ok(())
    }

    /// Queue bytes received from the client for the target.
    ///
    /// Never fails. Under [`FullQueuePolicy::Block`] this waits for room for
    /// as long as the session is live, stalling the caller's read loop. Under
    /// [`FullQueuePolicy::Drop`] a full queue frees the session instead of
    /// continuing the stream with a hole in it.
    pub async fn deliver_from_client(&self, packet: Bytes) {
        let len = packet.len();
        if !self.is_live() {
            debug!(conn = self.id, len, "session closing, client packet discarded");
            return;
        }
        *lock(&self.last_client_packet_at) = Some(Instant::now());

        let policy = self.settings.full_queue_policy;
        let outcome = match policy {
            FullQueuePolicy::Drop => self.to_target.try_push(packet),
            FullQueuePolicy::Block => self.push_while_live(&self.to_target, packet).await,
        };

        match outcome {
            Push::Queued => debug!(conn = self.id, len, "client packet queued"),
            Push::Dropped if policy == FullQueuePolicy::Drop => {
                warn!(conn = self.id, len, "client queue full, dropping connection");
                self.free();
            }
            Push::Dropped | Push::Closed => {
                debug!(conn = self.id, len, "session closing, client packet discarded")
            }
        }
    }

    /// Tear the session down. Only the first caller does any work; it
    /// returns `true`, every later or concurrent caller gets `false`.
    pub fn free(&self) -> bool {
        let claimed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                matches!(state, CONNECTING | ACTIVE).then_some(FREEING)
            })
            .is_ok();
        if !claimed {
            debug!(conn = self.id, "already freeing, skipping");
            return false;
        }

        info!(conn = self.id, "freeing session");

        self.target_connected.store(false, Ordering::Release);
        self.shutdown.cancel();
        if let Some(target) = lock(&self.target).take() {
            match target.shutdown(Shutdown::Both) {
                Ok(()) => debug!(conn = self.id, "target connection closed"),
                Err(e) if e.kind() == ErrorKind::NotConnected => {
                    debug!(conn = self.id, "target connection already closed")
                }
                Err(e) => warn!(conn = self.id, error = %e, "failed to close target connection"),
            }
        }

        if self.registry.deregister(self.id) {
            debug!(conn = self.id, "removed from registry");
        }

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in &tasks {
            task.abort();
        }

        self.to_target.close();
        self.to_client.close();

        self.state.store(FREED, Ordering::Release);

        let (to_target, to_client) = self.bytes_forwarded();
        info!(
            conn = self.id,
            to_target,
            to_client,
            lifetime_ms = self.connected_at.elapsed().as_millis() as u64,
            "session freed"
        );
        true
    }

    async fn read_target(self: Arc<Self>, mut reader: OwnedReadHalf) {
        debug!(conn = self.id, "target reader started");
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        while self.is_active() {
            buf.reserve(READ_BUFFER_SIZE);

            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                read = timeout(self.settings.io_timeout, reader.read_buf(&mut buf)) => read,
            };

            match read {
                // Nothing within the read timeout; loop to re-check the state.
                Err(_) => continue,
                Ok(Ok(0)) => {
                    info!(conn = self.id, "target finished sending");
                    break;
                }
                Ok(Ok(_)) => {
                    *lock(&self.last_target_packet_at) = Some(Instant::now());
                    if !self.enqueue_for_client(buf.split().freeze()).await {
                        break;
                    }
                }
                Ok(Err(e)) if is_transient(e.kind()) => continue,
                Ok(Err(e)) => {
                    info!(conn = self.id, error = %e, "target connection closed");
                    self.target_connected.store(false, Ordering::Release);
                    self.free();
                    break;
                }
            }
        }

        debug!(conn = self.id, "target reader stopped");
    }

    /// Push target data towards the client. Returns `false` once the
    /// session is closing.
    async fn enqueue_for_client(&self, packet: Bytes) -> bool {
        let len = packet.len();
        match self.push_while_live(&self.to_client, packet).await {
            Push::Queued => {
                debug!(conn = self.id, len, "target packet queued");
                true
            }
            Push::Dropped | Push::Closed => false,
        }
    }

    /// Push onto `queue`, waiting in `push_timeout` slices while the session
    /// is live. `Dropped` only comes back once the session is going away.
    async fn push_while_live(&self, queue: &PacketQueue, packet: Bytes) -> Push {
        loop {
            match queue.push_timeout(packet.clone(), self.settings.push_timeout).await {
                Push::Dropped if self.is_live() => {
                    debug!(conn = self.id, len = packet.len(), "queue full, waiting for room");
                }
                outcome => return outcome,
            }
        }
    }

    async fn forward_to_target(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        debug!(conn = self.id, "target forwarder started");

        while self.is_active() {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.to_target.pop_timeout(self.settings.pop_timeout) => next,
            };
            let packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(_) => break,
            };

            match timeout(self.settings.io_timeout, writer.write_all(&packet)).await {
                Ok(Ok(())) => {
                    self.bytes_to_target
                        .fetch_add(packet.len() as u64, Ordering::Relaxed);
                    debug!(conn = self.id, len = packet.len(), "forwarded to target");
                }
                Ok(Err(e)) => {
                    warn!(conn = self.id, error = %e, "write to target failed");
                    self.target_connected.store(false, Ordering::Release);
                    self.free();
                    break;
                }
                Err(_) => {
                    warn!(conn = self.id, "write to target timed out");
                    self.target_connected.store(false, Ordering::Release);
                    self.free();
                    break;
                }
            }
        }

        debug!(conn = self.id, "target forwarder stopped");
    }

    async fn forward_to_client(self: Arc<Self>) {
        debug!(conn = self.id, "client forwarder started");

        while self.is_active() {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.to_client.pop_timeout(self.settings.pop_timeout) => next,
            };
            let packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(_) => break,
            };

            match self.registry.send_to_client(self.id, &packet).await {
                Ok(()) => {
                    self.bytes_to_client
                        .fetch_add(packet.len() as u64, Ordering::Relaxed);
                    debug!(conn = self.id, len = packet.len(), "forwarded to client");
                }
                Err(e) => {
                    info!(conn = self.id, error = %e, "client unreachable");
                    self.free();
                    break;
                }
            }
        }

        debug!(conn = self.id, "client forwarder stopped");
    }
}

/// Split off a duplicate std handle that can shut the socket down while the
/// async halves are owned elsewhere.
fn detach_control(stream: TcpStream) -> std::io::Result<(TcpStream, std::net::TcpStream)> {
    let std_stream = stream.into_std()?;
    let control = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, control))
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::relay::queue::Closed;
    use crate::relay::registry::Registry;

    fn quiet_settings() -> RelaySettings {
        RelaySettings {
            queue_capacity: 4,
            pop_timeout: Duration::from_millis(50),
            heartbeat_warmup: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            ..RelaySettings::default()
        }
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_free_tears_down_once() {
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(7, registry.handle(), quiet_settings());
        registry.insert(session.clone());

        let mut callers = Vec::new();
        for _ in 0..16 {
            let session = session.clone();
            callers.push(tokio::spawn(async move { session.free() }));
        }

        let mut winners = 0;
        for caller in callers {
            if caller.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(session.lifecycle(), Lifecycle::Freed);
        assert!(!session.free());
    }

    #[tokio::test]
    async fn freed_session_is_deregistered_and_queues_are_closed() {
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(3, registry.handle(), quiet_settings());
        registry.insert(session.clone());
        assert!(registry.contains(3));

        session.free();

        assert!(!registry.contains(3));
        assert_eq!(session.client_queue().try_push(Bytes::from_static(b"x")), Push::Closed);
        assert_eq!(session.target_queue().try_push(Bytes::from_static(b"x")), Push::Closed);
        assert_eq!(
            session.client_queue().pop_timeout(Duration::from_secs(5)).await,
            Err(Closed)
        );
        assert_eq!(
            session.target_queue().pop_timeout(Duration::from_secs(5)).await,
            Err(Closed)
        );
    }

    #[tokio::test]
    async fn failed_dial_frees_without_spawning_tasks() {
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(11, registry.handle(), quiet_settings());
        registry.insert(session.clone());

        let err = session.start(&closed_port().await).await.unwrap_err();

        assert!(matches!(err, Error::Dial { .. }));
        assert_eq!(session.lifecycle(), Lifecycle::Freed);
        assert_eq!(session.running_tasks(), 0);
        assert!(!session.is_target_connected());
        assert!(!registry.contains(11));
    }

    #[tokio::test]
    async fn session_freed_before_dial_completes_never_activates() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(5, registry.handle(), quiet_settings());

        session.free();
        let err = session
            .start(&target.local_addr().unwrap().to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConnectionClosed(5)));
        assert_eq!(session.lifecycle(), Lifecycle::Freed);
        assert_eq!(session.running_tasks(), 0);
    }

    #[tokio::test]
    async fn start_spawns_four_tasks_and_free_stops_them() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(9, registry.handle(), quiet_settings());
        registry.insert(session.clone());

        session
            .start(&target.local_addr().unwrap().to_string())
            .await
            .unwrap();
        let (mut peer, _) = target.accept().await.unwrap();

        assert_eq!(session.lifecycle(), Lifecycle::Active);
        assert!(session.is_target_connected());
        assert_eq!(session.running_tasks(), 4);

        assert!(session.free());

        let mut buf = [0u8; 4];
        let read = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("target should see the connection close");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(session.running_tasks(), 0);
    }

    #[tokio::test]
    async fn client_packets_reach_the_target_in_order() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(12, registry.handle(), quiet_settings());
        registry.insert(session.clone());

        session
            .start(&target.local_addr().unwrap().to_string())
            .await
            .unwrap();
        let (mut peer, _) = target.accept().await.unwrap();

        session.deliver_from_client(Bytes::from_static(b"PING ")).await;
        session.deliver_from_client(Bytes::from_static(b"PONG")).await;

        let mut buf = [0u8; 9];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"PING PONG");

        wait_until(|| session.bytes_forwarded().0 == 9).await;
        assert!(session.last_client_packet_at().is_some());
        session.free();
    }

    #[tokio::test]
    async fn full_client_queue_frees_the_session_under_drop_policy() {
        let settings = RelaySettings {
            queue_capacity: 1,
            full_queue_policy: FullQueuePolicy::Drop,
            ..quiet_settings()
        };
        let registry = Registry::new("127.0.0.1:1", settings.clone());
        let session = RelaySession::new(2, registry.handle(), settings);
        registry.insert(session.clone());

        session.deliver_from_client(Bytes::from_static(b"kept")).await;
        assert!(session.is_live());
        session.deliver_from_client(Bytes::from_static(b"overflow")).await;

        assert_eq!(session.lifecycle(), Lifecycle::Freed);
        assert!(!registry.contains(2));
    }

    #[tokio::test]
    async fn full_client_queue_waits_for_room_under_block_policy() {
        let settings = RelaySettings {
            queue_capacity: 1,
            full_queue_policy: FullQueuePolicy::Block,
            push_timeout: Duration::from_millis(20),
            ..quiet_settings()
        };
        let registry = Registry::new("127.0.0.1:1", settings.clone());
        let session = RelaySession::new(4, registry.handle(), settings);

        session.deliver_from_client(Bytes::from_static(b"first")).await;
        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                session.deliver_from_client(Bytes::from_static(b"second")).await
            })
        };

        // Several push slices go by without the packet being given up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());
        assert_eq!(session.lifecycle(), Lifecycle::Connecting);

        let queue = session.client_queue();
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)).await,
            Ok(Some(Bytes::from_static(b"first")))
        );
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("delivery should finish once there is room")
            .unwrap();
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)).await,
            Ok(Some(Bytes::from_static(b"second")))
        );
    }

    #[tokio::test]
    async fn free_releases_a_blocked_delivery() {
        let settings = RelaySettings {
            queue_capacity: 1,
            full_queue_policy: FullQueuePolicy::Block,
            push_timeout: Duration::from_millis(20),
            ..quiet_settings()
        };
        let registry = Registry::new("127.0.0.1:1", settings.clone());
        let session = RelaySession::new(8, registry.handle(), settings);

        session.deliver_from_client(Bytes::from_static(b"first")).await;
        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                session.deliver_from_client(Bytes::from_static(b"second")).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.free();

        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("free should release the waiting delivery")
            .unwrap();
    }

    #[tokio::test]
    async fn delivery_after_free_is_discarded_quietly() {
        let registry = Registry::new("127.0.0.1:1", quiet_settings());
        let session = RelaySession::new(6, registry.handle(), quiet_settings());
        session.free();

        session.deliver_from_client(Bytes::from_static(b"late")).await;

        assert!(session.last_client_packet_at().is_none());
    }
}
