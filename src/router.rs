//! Router - multiplexes one XenStore connection between many callers.
//!
//! Provides:
//! - Request/reply correlation by request id
//! - A single writer at a time on the stream
//! - One reader task that owns the read half
//! - Watch event routing to subscribed monitors
//!
//! Connection loss is broadcast exactly once: every outstanding waiter is
//! resolved with [`XsError::Connection`] and every later call fails fast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{PacketConnection, PacketReader, PacketWriter};
use crate::error::{Result, XsError};
use crate::protocol::{Event, Operation, Packet};
use crate::transport::{Transport, XsStream};

type Reply = std::result::Result<Packet, XsError>;

/// Identifies one monitor's event queue inside the router.
pub type MonitorId = u64;

/// Mutable routing tables, guarded by one short-lived lock.
#[derive(Default)]
struct RouterState {
    waiters: HashMap<u32, oneshot::Sender<Reply>>,
    next_rq_id: u32,
    /// Monitor queues by id.
    monitors: HashMap<MonitorId, mpsc::UnboundedSender<Event>>,
    /// token -> monitor -> number of watches using that token
    subscriptions: HashMap<Vec<u8>, HashMap<MonitorId, usize>>,
    /// Set once, with the reason, when the connection dies.
    closed: Option<String>,
}

struct Shared {
    writer: AsyncMutex<PacketWriter>,
    state: Mutex<RouterState>,
    next_monitor_id: AtomicU64,
    name: String,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a request id and register its reply slot.
    fn register(&self) -> Result<(u32, oneshot::Receiver<Reply>)> {
        let mut state = self.state();
        if let Some(reason) = &state.closed {
            return Err(XsError::Connection(reason.clone()));
        }

        // Ids are opaque tokens: after wrapping, skip any still in flight
        let mut rq_id = state.next_rq_id;
        while state.waiters.contains_key(&rq_id) {
            rq_id = rq_id.wrapping_add(1);
        }
        state.next_rq_id = rq_id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        state.waiters.insert(rq_id, tx);
        Ok((rq_id, rx))
    }

    fn deregister(&self, rq_id: u32) {
        self.state().waiters.remove(&rq_id);
    }

    /// Route one inbound packet.
    fn dispatch(&self, packet: Packet) {
        if packet.op == Operation::WatchEvent {
            match Event::parse(&packet.payload) {
                Ok(event) => self.publish(event),
                Err(e) => tracing::warn!(error = %e, "dropping malformed watch event"),
            }
            return;
        }

        let waiter = self.state().waiters.remove(&packet.rq_id);
        let Some(waiter) = waiter else {
            tracing::debug!(rq_id = packet.rq_id, op = %packet.op, "dropping reply with no waiter");
            return;
        };

        tracing::trace!(rq_id = packet.rq_id, op = %packet.op, tx_id = packet.tx_id, "reply received");
        let reply = if packet.op == Operation::Error {
            let code = String::from_utf8_lossy(packet.payload_str()).into_owned();
            Err(XsError::from_wire(&code))
        } else {
            Ok(packet)
        };
        // The caller may have given up in the meantime
        let _ = waiter.send(reply);
    }

    fn publish(&self, event: Event) {
        let state = self.state();
        let Some(subscribers) = state.subscriptions.get(&event.token) else {
            tracing::debug!(path = %event.path_lossy(), token = %event.token_lossy(), "event for unknown token");
            return;
        };
        for monitor in subscribers.keys() {
            if let Some(queue) = state.monitors.get(monitor) {
                let _ = queue.send(event.clone());
            }
        }
    }

    /// Mark the connection dead and fail everyone waiting on it.
    fn poison(&self, reason: String) {
        let mut state = self.state();
        if state.closed.is_some() {
            return;
        }
        log::info!("XenStore connection {} closed: {}", self.name, reason);

        for (_, waiter) in state.waiters.drain() {
            let _ = waiter.send(Err(XsError::Connection(reason.clone())));
        }
        // Dropping the senders ends every monitor queue
        state.monitors.clear();
        state.subscriptions.clear();
        state.closed = Some(reason);
    }
}

/// Removes a waiter if its request future is dropped before the reply.
struct WaiterGuard<'a> {
    shared: &'a Shared,
    rq_id: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared.deregister(self.rq_id);
    }
}

/// Multiplexer over a single XenStore connection.
pub struct Router {
    shared: Arc<Shared>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Start routing over an already-open stream.
    ///
    /// Spawns the reader task, so this must run inside a tokio runtime.
    pub fn new(stream: Box<dyn XsStream>) -> Result<Self> {
        Self::with_name(stream, "stream")
    }

    /// Open `transport` and start routing over it.
    pub async fn connect(transport: &dyn Transport) -> Result<Self> {
        let stream = transport.connect().await?;
        log::debug!("Connected to XenStore at {}", transport.describe());
        Self::with_name(stream, transport.describe())
    }

    fn with_name(stream: Box<dyn XsStream>, name: impl Into<String>) -> Result<Self> {
        let (writer, reader) = PacketConnection::new(stream).into_split()?;
        let shared = Arc::new(Shared {
            writer: AsyncMutex::new(writer),
            state: Mutex::new(RouterState::default()),
            next_monitor_id: AtomicU64::new(1),
            name: name.into(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_reader(Arc::clone(&shared), reader, shutdown_rx));

        Ok(Self {
            shared,
            shutdown: Mutex::new(Some(shutdown_tx)),
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Send a request and wait for its reply payload.
    ///
    /// Only the physical write is serialized; waiting for the reply is
    /// independent per caller. Dropping the returned future deregisters the
    /// waiter, and a reply that still arrives is discarded.
    pub async fn request(&self, op: Operation, tx_id: u32, payload: Vec<u8>) -> Result<Vec<u8>> {
        // Size check happens before an id is even allocated
        let mut packet = Packet::new(op, 0, tx_id, payload)?;

        let (rq_id, reply) = self.shared.register()?;
        let _guard = WaiterGuard {
            shared: &self.shared,
            rq_id,
        };
        packet.rq_id = rq_id;

        tracing::trace!(rq_id, op = %op, tx_id, len = packet.payload.len(), "sending request");
        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.send(packet).await {
                drop(writer);
                let reason = format!("error writing to {}: {}", self.shared.name, e);
                self.shared.poison(reason.clone());
                return Err(XsError::Connection(reason));
            }
        }

        let packet = match reply.await {
            Ok(result) => result?,
            Err(_) => return Err(XsError::Connection("router stopped".into())),
        };

        if packet.op != op || packet.tx_id != tx_id {
            return Err(XsError::UnexpectedPacket(format!(
                "sent {} (tx {}), got {} (tx {})",
                op, tx_id, packet.op, packet.tx_id
            )));
        }
        Ok(packet.payload)
    }

    /// False once the connection has been lost or closed.
    pub fn is_connected(&self) -> bool {
        self.shared.state().closed.is_none()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.state().waiters.len()
    }

    /// Stop the reader, fail pending requests and close the stream.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&self) -> Result<()> {
        let shutdown = lock(&self.shutdown).take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        let handle = lock(&self.reader).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("XenStore reader task failed: {}", e);
            }
        }
        self.shared.poison("connection closed".into());

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.close().await {
            // the peer may already be gone
            log::debug!("Error closing XenStore stream: {}", e);
        }
        Ok(())
    }

    /// Create an event queue for a new monitor.
    pub fn register_monitor(&self) -> Result<(MonitorId, mpsc::UnboundedReceiver<Event>)> {
        let mut state = self.shared.state();
        if let Some(reason) = &state.closed {
            return Err(XsError::Connection(reason.clone()));
        }
        let id = self.shared.next_monitor_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.monitors.insert(id, tx);
        Ok((id, rx))
    }

    /// Deliver events carrying `token` to `monitor`.
    pub fn subscribe(&self, monitor: MonitorId, token: &[u8]) {
        let mut state = self.shared.state();
        if state.closed.is_some() {
            return;
        }
        *state
            .subscriptions
            .entry(token.to_vec())
            .or_default()
            .entry(monitor)
            .or_insert(0) += 1;
    }

    /// Undo one [`subscribe`](Self::subscribe) call.
    pub fn unsubscribe(&self, monitor: MonitorId, token: &[u8]) {
        let mut state = self.shared.state();
        let Some(subscribers) = state.subscriptions.get_mut(token) else {
            return;
        };
        if let Some(count) = subscribers.get_mut(&monitor) {
            *count -= 1;
            if *count == 0 {
                subscribers.remove(&monitor);
            }
        }
        if subscribers.is_empty() {
            state.subscriptions.remove(token);
        }
    }

    /// Drop a monitor's queue and all of its subscriptions.
    pub fn release_monitor(&self, monitor: MonitorId) {
        let mut state = self.shared.state();
        state.monitors.remove(&monitor);
        state.subscriptions.retain(|_, subscribers| {
            subscribers.remove(&monitor);
            !subscribers.is_empty()
        });
    }

    #[cfg(test)]
    fn set_next_request_id(&self, rq_id: u32) {
        self.shared.state().next_rq_id = rq_id;
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.shared.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reader loop: the only code that ever reads the stream.
async fn run_reader(shared: Arc<Shared>, mut reader: PacketReader, mut shutdown: oneshot::Receiver<()>) {
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => break "connection closed".to_string(),
            received = reader.receive() => match received {
                Ok(packet) => shared.dispatch(packet),
                Err(e) => {
                    tracing::warn!(error = %e, "XenStore reader stopping");
                    break e.to_string();
                }
            },
        }
    };
    shared.poison(reason);
}
