//! Live connection registry.
//!
//! Writers are the connect/disconnect handlers running on the loop thread.
//! The map sits behind a mutex because the health endpoint reads it too.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sockloop_core::{SessionError, SessionId};
use tracing::{debug, info, warn};

/// Connection-establishment metadata (remote address, user agent, …).
pub type RemoteContext = BTreeMap<String, String>;

/// One live client session.
#[derive(Clone, Debug)]
pub struct Connection {
    /// Session identifier.
    pub id: SessionId,
    /// Metadata captured at connect time. Never mutated.
    pub remote_context: Arc<RemoteContext>,
    /// When the session connected.
    pub connected_at: DateTime<Utc>,
    /// When the last inbound event arrived.
    pub last_seen: DateTime<Utc>,
    /// Payload of the last inbound event.
    pub last_message: Option<Value>,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    connections: HashMap<SessionId, Connection>,
}

/// Map of session id to [`Connection`].
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. The first registration of an id wins.
    pub fn add(&self, id: SessionId, context: RemoteContext) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.connections.contains_key(&id) {
            warn!(session_id = %id, "duplicate connect ignored");
            return Err(SessionError::Duplicate(id));
        }

        let now = Utc::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let connection = Connection {
            id: id.clone(),
            remote_context: Arc::new(context),
            connected_at: now,
            last_seen: now,
            last_message: None,
            seq,
        };
        let _ = inner.connections.insert(id.clone(), connection);
        info!(session_id = %id, live = inner.connections.len(), "session connected");
        Ok(())
    }

    /// Remove a session.
    pub fn remove(&self, id: &SessionId) -> Result<Connection, SessionError> {
        let mut inner = self.inner.lock();
        match inner.connections.remove(id) {
            Some(connection) => {
                info!(session_id = %id, live = inner.connections.len(), "session disconnected");
                Ok(connection)
            }
            None => {
                warn!(session_id = %id, "disconnect for unknown session");
                Err(SessionError::Unknown(id.clone()))
            }
        }
    }

    /// Record an inbound event for a session.
    pub fn touch(&self, id: &SessionId, payload: Value) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(connection) = inner.connections.get_mut(id) else {
            return Err(SessionError::Unknown(id.clone()));
        };
        connection.last_seen = Utc::now();
        connection.last_message = Some(payload);
        debug!(session_id = %id, "session touched");
        Ok(())
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().connections.contains_key(id)
    }

    /// Copy of one connection record.
    pub fn get(&self, id: &SessionId) -> Option<Connection> {
        self.inner.lock().connections.get(id).cloned()
    }

    /// Point-in-time list of ids, in registration order.
    pub fn snapshot_ids(&self) -> Vec<SessionId> {
        let inner = self.inner.lock();
        let mut entries: Vec<(u64, SessionId)> = inner
            .connections
            .values()
            .map(|c| (c.seq, c.id.clone()))
            .collect();
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use sockloop_logging::capture_logs;
    use tracing::Level;

    fn ctx(addr: &str) -> RemoteContext {
        RemoteContext::from([("remote_addr".to_string(), addr.to_string())])
    }

    #[test]
    fn add_and_remove() {
        let registry = ConnectionRegistry::new();
        let id = SessionId::from("a");
        registry.add(id.clone(), ctx("1.1.1.1:1")).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_connect_keeps_first() {
        let (logs, _guard) = capture_logs();
        let registry = ConnectionRegistry::new();
        let id = SessionId::from("a");
        registry.add(id.clone(), ctx("first")).unwrap();

        assert_matches!(
            registry.add(id.clone(), ctx("second")),
            Err(SessionError::Duplicate(dup)) if dup == id
        );
        assert_eq!(registry.len(), 1);
        let conn = registry.get(&id).unwrap();
        assert_eq!(conn.remote_context["remote_addr"], "first");
        assert!(logs.has_event(Level::WARN, "duplicate connect"));
    }

    #[test]
    fn unknown_disconnect_is_noop() {
        let (logs, _guard) = capture_logs();
        let registry = ConnectionRegistry::new();
        registry.add(SessionId::from("a"), RemoteContext::new()).unwrap();

        assert_matches!(
            registry.remove(&SessionId::from("zzz")),
            Err(SessionError::Unknown(_))
        );
        assert_eq!(registry.len(), 1);
        assert!(logs.has_event(Level::WARN, "unknown session"));
    }

    #[test]
    fn reconnect_after_disconnect() {
        let registry = ConnectionRegistry::new();
        let id = SessionId::from("a");
        registry.add(id.clone(), RemoteContext::new()).unwrap();
        let _ = registry.remove(&id).unwrap();
        registry.add(id.clone(), RemoteContext::new()).unwrap();
        assert!(registry.contains(&id));
    }

    #[test]
    fn touch_updates_last_message() {
        let registry = ConnectionRegistry::new();
        let id = SessionId::from("a");
        registry.add(id.clone(), RemoteContext::new()).unwrap();
        let before = registry.get(&id).unwrap();
        assert!(before.last_message.is_none());

        registry.touch(&id, json!({"event": "short_request"})).unwrap();
        let after = registry.get(&id).unwrap();
        assert_eq!(after.last_message, Some(json!({"event": "short_request"})));
        assert!(after.last_seen >= before.last_seen);
        assert_eq!(after.connected_at, before.connected_at);
    }

    #[test]
    fn touch_unknown_session() {
        let registry = ConnectionRegistry::new();
        assert_matches!(
            registry.touch(&SessionId::from("x"), json!(null)),
            Err(SessionError::Unknown(_))
        );
    }

    #[test]
    fn snapshot_is_in_registration_order() {
        let registry = ConnectionRegistry::new();
        for name in ["c", "a", "b"] {
            registry.add(SessionId::from(name), RemoteContext::new()).unwrap();
        }
        let _ = registry.remove(&SessionId::from("a")).unwrap();
        let ids: Vec<String> = registry
            .snapshot_ids()
            .into_iter()
            .map(SessionId::into_inner)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn membership_tracks_connect_disconnect_sequences() {
        let registry = ConnectionRegistry::new();
        let mut expected = std::collections::HashSet::new();
        let ops: [(bool, &str); 8] = [
            (true, "a"),
            (true, "b"),
            (true, "a"),
            (false, "a"),
            (false, "a"),
            (true, "c"),
            (false, "zz"),
            (true, "a"),
        ];
        for (connect, name) in ops {
            let id = SessionId::from(name);
            if connect {
                let _ = registry.add(id.clone(), RemoteContext::new());
                let _ = expected.insert(id);
            } else {
                let _ = registry.remove(&id);
                let _ = expected.remove(&id);
            }
            assert_eq!(registry.len(), expected.len());
            for id in &expected {
                assert!(registry.contains(id));
            }
        }
    }
}
