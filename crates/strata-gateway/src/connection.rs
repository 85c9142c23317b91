use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use strata_core::types::SessionId;

/// Per-connection outbound channel depth.
const CHANNEL_CAPACITY: usize = 256;

/// One live client connection. Frames pushed here are written to the
/// socket by the connection's writer task.
pub struct Connection {
    id: String,
    session_id: SessionId,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    tx: mpsc::Sender<String>,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    /// Push a frame to this connection only. Returns false if it was not taken.
    pub fn send(&self, message: String) -> bool {
        matches!(try_deliver(self, message), SendOutcome::Sent)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
            last_activity: *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub session_id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

enum SendOutcome {
    Sent,
    Dropped,
    Closed,
}

fn try_deliver(conn: &Connection, message: String) -> SendOutcome {
    match conn.tx.try_send(message) {
        Ok(()) => SendOutcome::Sent,
        Err(TrySendError::Full(_)) => {
            warn!(connection = %conn.id, session_id = %conn.session_id, "Outbound channel full, dropping frame");
            SendOutcome::Dropped
        }
        Err(TrySendError::Closed(_)) => SendOutcome::Closed,
    }
}

/// Frames held for a session with no live connection.
struct OfflineRing {
    frames: VecDeque<String>,
    last_queued: Instant,
}

impl Default for OfflineRing {
    fn default() -> Self {
        Self {
            frames: VecDeque::new(),
            last_queued: Instant::now(),
        }
    }
}

/// Live connections per session, several per session allowed (tabs, windows).
///
/// Frames for a session with no live connection go to a bounded ring that
/// is replayed, oldest first, to the next connection of that session.
/// Rings nobody comes back for are dropped by [`purge_idle`](Self::purge_idle).
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, Vec<Arc<Connection>>>,
    offline: DashMap<SessionId, OfflineRing>,
    offline_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(offline_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            offline: DashMap::new(),
            offline_capacity,
        }
    }

    /// Register a connection; queued offline frames are already in the
    /// returned receiver.
    pub fn connect(&self, session: &SessionId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY.max(self.offline_capacity));
        let now = Utc::now();
        let conn = Arc::new(Connection {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.clone(),
            connected_at: now,
            last_activity: Mutex::new(now),
            tx,
        });

        // Hold the session entry so no frame slips into the ring mid-replay
        let mut entry = self.sessions.entry(session.clone()).or_default();
        let replayed = match self.offline.remove(session) {
            Some((_, ring)) => {
                let n = ring.frames.len();
                for frame in ring.frames {
                    let _ = conn.tx.try_send(frame);
                }
                n
            }
            None => 0,
        };
        entry.push(Arc::clone(&conn));
        let total = entry.len();
        drop(entry);

        info!(
            session_id = %session,
            connection = %conn.id,
            connections = total,
            replayed,
            "Client connected"
        );
        (conn, rx)
    }

    pub fn disconnect(&self, session: &SessionId, connection_id: &str) {
        if let Entry::Occupied(mut entry) = self.sessions.entry(session.clone()) {
            entry.get_mut().retain(|c| c.id != connection_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        debug!(session_id = %session, connection = %connection_id, "Client disconnected");
    }

    /// Record activity on a connection. Returns false if it is not registered.
    pub fn touch(&self, session: &SessionId, connection_id: &str) -> bool {
        let Some(conns) = self.sessions.get(session) else {
            return false;
        };
        match conns.iter().find(|c| c.id == connection_id) {
            Some(conn) => {
                conn.touch();
                true
            }
            None => false,
        }
    }

    /// Send to the session's oldest connection. Returns whether a live
    /// connection took the frame; otherwise it was queued.
    pub fn send_to_first(&self, session: &SessionId, message: String) -> bool {
        let Some(targets) = self.targets_or_queue(session, &message) else {
            return false;
        };
        for conn in &targets {
            match try_deliver(conn, message.clone()) {
                SendOutcome::Sent => return true,
                SendOutcome::Dropped => return false,
                SendOutcome::Closed => self.disconnect(session, &conn.id),
            }
        }
        self.queue_offline(session, message);
        false
    }

    /// Send to every connection of a session. Returns the number of
    /// connections that took the frame; zero means it was queued or dropped.
    pub fn broadcast(&self, session: &SessionId, message: String) -> usize {
        let Some(targets) = self.targets_or_queue(session, &message) else {
            return 0;
        };
        let mut delivered = 0;
        let mut live = 0;
        for conn in &targets {
            match try_deliver(conn, message.clone()) {
                SendOutcome::Sent => {
                    delivered += 1;
                    live += 1;
                }
                SendOutcome::Dropped => live += 1,
                SendOutcome::Closed => self.disconnect(session, &conn.id),
            }
        }
        if live == 0 {
            self.queue_offline(session, message);
        }
        delivered
    }

    /// Send to every live connection of every session. Nothing is queued.
    pub fn broadcast_all(&self, message: &str) -> usize {
        let all: Vec<Arc<Connection>> = self
            .sessions
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        let mut delivered = 0;
        for conn in all {
            match try_deliver(&conn, message.to_string()) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Dropped => {}
                SendOutcome::Closed => self.disconnect(&conn.session_id, &conn.id),
            }
        }
        delivered
    }

    /// Current connections of a session, or queue the frame if there are none.
    fn targets_or_queue(&self, session: &SessionId, message: &str) -> Option<Vec<Arc<Connection>>> {
        match self.sessions.entry(session.clone()) {
            Entry::Occupied(entry) if !entry.get().is_empty() => Some(entry.get().clone()),
            _ => {
                self.queue_offline(session, message.to_string());
                None
            }
        }
    }

    fn queue_offline(&self, session: &SessionId, message: String) {
        if self.offline_capacity == 0 {
            return;
        }
        let mut ring = self.offline.entry(session.clone()).or_default();
        if ring.frames.len() >= self.offline_capacity {
            ring.frames.pop_front();
        }
        ring.frames.push_back(message);
        ring.last_queued = Instant::now();
    }

    /// Drop offline rings that have not grown for `ttl`. Returns the number dropped.
    pub fn purge_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.offline.len();
        self.offline
            .retain(|_, ring| now.duration_since(ring.last_queued) < ttl);
        let purged = before.saturating_sub(self.offline.len());
        if purged > 0 {
            debug!(purged, "Idle offline queues dropped");
        }
        purged
    }

    /// Sessions currently holding offline frames.
    pub fn offline_sessions(&self) -> usize {
        self.offline.len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connections(&self, session: &SessionId) -> Vec<ConnectionInfo> {
        self.sessions
            .get(session)
            .map(|conns| conns.iter().map(|c| c.info()).collect())
            .unwrap_or_default()
    }

    pub fn queued(&self, session: &SessionId) -> usize {
        self.offline.get(session).map(|r| r.frames.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(s: &str) -> SessionId {
        SessionId::from_string(s)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_tab() {
        let registry = ConnectionRegistry::new(10);
        let (_a, mut rx_a) = registry.connect(&session("s1"));
        let (_b, mut rx_b) = registry.connect(&session("s1"));
        let (_c, mut rx_c) = registry.connect(&session("s2"));

        assert_eq!(registry.broadcast(&session("s1"), "hello".into()), 2);
        assert_eq!(rx_a.recv().await.unwrap(), "hello");
        assert_eq!(rx_b.recv().await.unwrap(), "hello");
        assert!(rx_c.try_recv().is_err());
        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.session_count(), 2);
    }

    #[tokio::test]
    async fn test_send_to_first_uses_oldest_connection() {
        let registry = ConnectionRegistry::new(10);
        let (_a, mut rx_a) = registry.connect(&session("s1"));
        let (_b, mut rx_b) = registry.connect(&session("s1"));

        assert!(registry.send_to_first(&session("s1"), "only".into()));
        assert_eq!(rx_a.recv().await.unwrap(), "only");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_ring_is_bounded_and_replayed() {
        let registry = ConnectionRegistry::new(3);
        for i in 0..5 {
            assert_eq!(registry.broadcast(&session("s1"), format!("m{i}")), 0);
        }
        assert_eq!(registry.queued(&session("s1")), 3);

        let (_conn, mut rx) = registry.connect(&session("s1"));
        assert_eq!(registry.queued(&session("s1")), 0);
        for expected in ["m2", "m3", "m4"] {
            assert_eq!(rx.recv().await.unwrap(), expected);
        }
        registry.broadcast(&session("s1"), "live".into());
        assert_eq!(rx.recv().await.unwrap(), "live");
    }

    #[tokio::test]
    async fn test_closed_connection_is_pruned_and_frame_queued() {
        let registry = ConnectionRegistry::new(10);
        let (_conn, rx) = registry.connect(&session("s1"));
        drop(rx);

        assert_eq!(registry.broadcast(&session("s1"), "late".into()), 0);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.queued(&session("s1")), 1);
    }

    #[tokio::test]
    async fn test_disconnect_and_touch() {
        let registry = ConnectionRegistry::new(10);
        let (conn, _rx) = registry.connect(&session("s1"));
        let before = registry.connections(&session("s1"))[0].last_activity;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.touch(&session("s1"), conn.id()));
        assert!(registry.connections(&session("s1"))[0].last_activity > before);

        registry.disconnect(&session("s1"), conn.id());
        assert!(!registry.touch(&session("s1"), conn.id()));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_offline_rings_are_purged() {
        let registry = ConnectionRegistry::new(10);
        for i in 0..50 {
            registry.broadcast(&session(&format!("gone-{i}")), "frame".into());
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        registry.broadcast(&session("recent"), "frame".into());

        assert_eq!(registry.purge_idle(Duration::from_millis(30)), 50);
        assert_eq!(registry.offline_sessions(), 1);
        assert_eq!(registry.queued(&session("gone-0")), 0);
        assert_eq!(registry.queued(&session("recent")), 1);
    }

    #[tokio::test]
    async fn test_broadcast_all_skips_offline_sessions() {
        let registry = ConnectionRegistry::new(10);
        let (_a, mut rx_a) = registry.connect(&session("s1"));
        let (_b, mut rx_b) = registry.connect(&session("s2"));

        assert_eq!(registry.broadcast_all("notice"), 2);
        assert_eq!(rx_a.recv().await.unwrap(), "notice");
        assert_eq!(rx_b.recv().await.unwrap(), "notice");
        assert_eq!(registry.queued(&session("s3")), 0);
    }
}
