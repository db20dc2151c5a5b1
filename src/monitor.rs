//! Monitor - watch registrations and the queue of delivered events.
//!
//! Every monitor gets its own unbounded queue inside the [`Router`]. The
//! reader task pushes each watch event to the monitors subscribed to its
//! token; [`Monitor::wait`] pops them one at a time. Concurrent waiters on
//! the same monitor share the queue, so each event reaches exactly one of
//! them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::error::{Result, XsError};
use crate::protocol::{Event, NUL, Operation};
use crate::router::{MonitorId, Router};
use crate::transaction::is_ok;
use crate::validate::{validate_payload_bytes, validate_watch_path};

type Watch = (Vec<u8>, Vec<u8>);

/// Watch control for one connection.
pub struct Monitor {
    router: Arc<Router>,
    id: MonitorId,
    events: AsyncMutex<mpsc::UnboundedReceiver<Event>>,
    watched: Mutex<HashSet<Watch>>,
    // WATCH sent, ack not yet processed
    pending: Mutex<Vec<Watch>>,
}

impl Monitor {
    /// Create a monitor with an empty queue on `router`.
    pub fn new(router: Arc<Router>) -> Result<Self> {
        let (id, events) = router.register_monitor()?;
        Ok(Self {
            router,
            id,
            events: AsyncMutex::new(events),
            watched: Mutex::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn watched_set(&self) -> MutexGuard<'_, HashSet<Watch>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_set(&self) -> MutexGuard<'_, Vec<Watch>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_pending(&self, key: &Watch) {
        let mut pending = self.pending_set();
        if let Some(pos) = pending.iter().position(|w| w == key) {
            pending.swap_remove(pos);
        }
    }

    /// Ask the server for events on `path` labelled with `token`.
    ///
    /// Registering the same pair twice fails with
    /// [`XsError::InvalidOperation`].
    pub async fn watch(&self, path: impl AsRef<[u8]>, token: impl AsRef<[u8]>) -> Result<()> {
        let (path, token) = (path.as_ref(), token.as_ref());
        let payload = watch_payload(path, token)?;

        // xenstored fires one event as soon as the watch is set, so the
        // subscription has to exist before the ack arrives
        let key = (path.to_vec(), token.to_vec());
        self.router.subscribe(self.id, token);
        self.pending_set().push(key.clone());
        let result = self.router.request(Operation::Watch, 0, payload).await;
        if matches!(&result, Ok(reply) if is_ok(reply)) {
            self.watched_set().insert(key.clone());
        }
        self.finish_pending(&key);
        match result {
            Ok(reply) if is_ok(&reply) => {
                log::debug!(
                    "Watching {} with token {}",
                    String::from_utf8_lossy(path),
                    String::from_utf8_lossy(token)
                );
                Ok(())
            }
            Ok(reply) => {
                self.router.unsubscribe(self.id, token);
                Err(XsError::UnexpectedPacket(format!(
                    "WATCH replied {:?}",
                    String::from_utf8_lossy(&reply)
                )))
            }
            Err(e) => {
                self.router.unsubscribe(self.id, token);
                Err(e)
            }
        }
    }

    /// Remove a watch previously set with [`watch`](Self::watch).
    pub async fn unwatch(&self, path: impl AsRef<[u8]>, token: impl AsRef<[u8]>) -> Result<()> {
        let (path, token) = (path.as_ref(), token.as_ref());
        let key = (path.to_vec(), token.to_vec());
        if !self.watched_set().contains(&key) {
            return Err(XsError::invalid_operation(format!(
                "{} is not watched with token {}",
                String::from_utf8_lossy(path),
                String::from_utf8_lossy(token)
            )));
        }

        let payload = watch_payload(path, token)?;
        let result = self.router.request(Operation::Unwatch, 0, payload).await;
        let forget = match &result {
            Ok(_) => true,
            Err(e) => e.is_not_found(),
        };
        if forget {
            self.watched_set().remove(&key);
            self.router.unsubscribe(self.id, token);
        }

        match result {
            Ok(reply) if is_ok(&reply) => Ok(()),
            Ok(reply) => Err(XsError::UnexpectedPacket(format!(
                "UNWATCH replied {:?}",
                String::from_utf8_lossy(&reply)
            ))),
            Err(e) if e.is_not_found() => Err(XsError::InvalidOperation {
                message: format!("server has no watch on {}", String::from_utf8_lossy(path)),
                code: e.wire_code().map(str::to_string),
            }),
            Err(e) => Err(e),
        }
    }

    /// Wait for the next event on one of this monitor's watches.
    ///
    /// Events whose path is neither a watched path nor below one (for the
    /// token they carry) are skipped.
    pub async fn wait(&self) -> Result<Event> {
        loop {
            let event = self.wait_any().await?;
            if self.is_watched(&event) {
                return Ok(event);
            }
            tracing::debug!(
                path = %event.path_lossy(),
                token = %event.token_lossy(),
                "skipping event for unwatched path"
            );
        }
    }

    /// Wait for the next event routed to this monitor, unfiltered.
    pub async fn wait_any(&self) -> Result<Event> {
        if !self.router.is_connected() {
            return Err(closed());
        }
        let mut events = self.events.lock().await;
        events.recv().await.ok_or_else(closed)
    }

    /// Paths that currently have at least one watch.
    pub fn watched(&self) -> HashSet<Vec<u8>> {
        self.watched_set().iter().map(|(path, _)| path.clone()).collect()
    }

    /// Remove every watch this monitor registered.
    ///
    /// All watches are attempted; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let watches: Vec<Watch> = self.watched_set().iter().cloned().collect();
        let mut first_error = None;
        for (path, token) in watches {
            if let Err(e) = self.unwatch(&path, &token).await {
                log::warn!(
                    "Failed to unwatch {}: {}",
                    String::from_utf8_lossy(&path),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_watched(&self, event: &Event) -> bool {
        let hit = |(path, token): &Watch| *token == event.token && covers(path, &event.path);
        if self.watched_set().iter().any(hit) {
            return true;
        }
        self.pending_set().iter().any(hit)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.router.release_monitor(self.id);
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("watches", &self.watched_set().len())
            .finish()
    }
}

fn closed() -> XsError {
    XsError::Connection("connection closed".into())
}

fn watch_payload(path: &[u8], token: &[u8]) -> Result<Vec<u8>> {
    validate_watch_path(path)?;
    validate_payload_bytes(token)?;
    if token.is_empty() || token.contains(&NUL) {
        return Err(XsError::InvalidPayload(
            "watch token must be non-empty and contain no NUL".into(),
        ));
    }

    let mut payload = Vec::with_capacity(path.len() + token.len() + 2);
    payload.extend_from_slice(path);
    payload.push(NUL);
    payload.extend_from_slice(token);
    payload.push(NUL);
    Ok(payload)
}

/// Does a watch on `watched` fire for a change at `path`?
fn covers(watched: &[u8], path: &[u8]) -> bool {
    if watched == path || watched == b"/" {
        return true;
    }
    path.strip_prefix(watched)
        .is_some_and(|rest| rest.first() == Some(&b'/'))
}
