//! Live connections per principal, and each principal's private channel.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tracing::{debug, info};

use crate::{
    model::{ConnectionId, Principal, PrincipalId},
    protocol::ServerEvent,
    ChatError, ChatResult,
};

/// Events queued for a connection's socket writer.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnected,
    Logout,
    Idle,
    Unauthenticated,
    MalformedFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        connection_id: ConnectionId,
        principal_id: PrincipalId,
    },
    Closed {
        connection_id: ConnectionId,
        principal_id: PrincipalId,
        reason: CloseReason,
    },
}

struct ConnectionEntry {
    principal: Principal,
    outbox: Outbox,
    closer: Arc<Notify>,
    connected_at: Instant,
    last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_principal: HashMap<PrincipalId, HashSet<ConnectionId>>,
    private: HashMap<PrincipalId, HashSet<ConnectionId>>,
}

impl Inner {
    fn unlink(map: &mut HashMap<PrincipalId, HashSet<ConnectionId>>, principal: &PrincipalId, id: ConnectionId) {
        if let Some(set) = map.get_mut(principal) {
            set.remove(&id);
            if set.is_empty() {
                map.remove(principal);
            }
        }
    }
}

/// A freshly registered connection.
pub struct Registration {
    pub connection_id: ConnectionId,
    pub principal: Principal,
    /// Notified when the server wants the socket closed (idle, logout).
    pub closer: Arc<Notify>,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    sessions: broadcast::Sender<SessionEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            sessions: broadcast::channel(256).0,
        }
    }

    /// Binds a new connection to `principal` and subscribes it to the
    /// principal's private channel.
    pub async fn register(&self, principal: Principal, outbox: Outbox) -> Registration {
        let connection_id = ConnectionId::new();
        let closer = Arc::new(Notify::new());
        let now = Instant::now();
        let principal_id = principal.id.clone();

        {
            let mut inner = self.inner.write().await;
            inner
                .by_principal
                .entry(principal_id.clone())
                .or_default()
                .insert(connection_id);
            inner
                .private
                .entry(principal_id.clone())
                .or_default()
                .insert(connection_id);
            inner.connections.insert(
                connection_id,
                ConnectionEntry {
                    principal: principal.clone(),
                    outbox,
                    closer: Arc::clone(&closer),
                    connected_at: now,
                    last_seen: now,
                },
            );
        }

        info!(%connection_id, principal = %principal_id, "connection registered");
        let _ = self.sessions.send(SessionEvent::Opened {
            connection_id,
            principal_id,
        });

        Registration {
            connection_id,
            principal,
            closer,
        }
    }

    /// Forgets the connection. Returns its principal when it was registered.
    pub async fn unregister(&self, id: ConnectionId, reason: CloseReason) -> Option<Principal> {
        let entry = {
            let mut inner = self.inner.write().await;
            let entry = inner.connections.remove(&id)?;
            Inner::unlink(&mut inner.by_principal, &entry.principal.id, id);
            Inner::unlink(&mut inner.private, &entry.principal.id, id);
            entry
        };

        info!(
            connection_id = %id,
            principal = %entry.principal.id,
            ?reason,
            lived = ?entry.connected_at.elapsed(),
            "connection unregistered"
        );
        let _ = self.sessions.send(SessionEvent::Closed {
            connection_id: id,
            principal_id: entry.principal.id.clone(),
            reason,
        });
        Some(entry.principal)
    }

    /// Asks the connection's socket task to shut down.
    pub async fn close(&self, id: ConnectionId) -> bool {
        match self.inner.read().await.connections.get(&id) {
            Some(entry) => {
                entry.closer.notify_one();
                true
            }
            None => false,
        }
    }

    pub async fn principal_of(&self, id: ConnectionId) -> Option<Principal> {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .map(|entry| entry.principal.clone())
    }

    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.read().await.connections.contains_key(&id)
    }

    pub async fn connections_of(&self, principal: &PrincipalId) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .by_principal
            .get(principal)
            .cloned()
            .unwrap_or_default()
    }

    /// Every live connection of `principal` with its outbox.
    pub async fn outboxes_of(&self, principal: &PrincipalId) -> Vec<(ConnectionId, Outbox)> {
        let inner = self.inner.read().await;
        inner
            .by_principal
            .get(principal)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).map(|e| (*id, e.outbox.clone())))
            .collect()
    }

    /// Resubscribes a connection to its principal's private channel.
    /// Returns `false` when it already was subscribed.
    pub async fn join_private(&self, id: ConnectionId) -> ChatResult<bool> {
        let mut inner = self.inner.write().await;
        let principal = inner
            .connections
            .get(&id)
            .map(|entry| entry.principal.id.clone())
            .ok_or(ChatError::Unauthenticated)?;
        Ok(inner.private.entry(principal).or_default().insert(id))
    }

    /// Best-effort delivery to every private-channel subscriber of
    /// `principal`. Returns how many connections accepted the event.
    pub async fn notify_private(&self, principal: &PrincipalId, event: ServerEvent) -> usize {
        let inner = self.inner.read().await;
        let delivered = inner
            .private
            .get(principal)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id))
            .filter(|entry| entry.outbox.send(event.clone()).is_ok())
            .count();
        debug!(%principal, delivered, "private notification");
        delivered
    }

    pub async fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.write().await.connections.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Connections not seen since `cutoff`.
    pub async fn idle_since(&self, cutoff: Instant) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .connections
            .iter()
            .filter(|(_, entry)| entry.last_seen <= cutoff)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn register_subscribes_private_channel() {
        let registry = ConnectionRegistry::new();
        let alice = testing::principal("u1", "alice");
        let (outbox, mut rx) = testing::outbox();

        let reg = registry.register(alice.clone(), outbox).await;
        assert_eq!(registry.connections_of(&alice.id).await, HashSet::from([reg.connection_id]));

        let delivered = registry.notify_private(&alice.id, ServerEvent::Pong).await;
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await, Some(ServerEvent::Pong));

        assert!(!registry.join_private(reg.connection_id).await.unwrap());
    }

    #[tokio::test]
    async fn multi_device_and_unregister() {
        let registry = ConnectionRegistry::new();
        let alice = testing::principal("u1", "alice");
        let (phone, _phone_rx) = testing::outbox();
        let (laptop, mut laptop_rx) = testing::outbox();

        let phone = registry.register(alice.clone(), phone).await;
        let laptop_id = registry.register(alice.clone(), laptop).await.connection_id;
        assert_eq!(registry.connections_of(&alice.id).await.len(), 2);

        let gone = registry.unregister(phone.connection_id, CloseReason::Disconnected).await;
        assert_eq!(gone.map(|p| p.id), Some(alice.id.clone()));
        assert!(registry.unregister(phone.connection_id, CloseReason::Disconnected).await.is_none());

        assert_eq!(registry.notify_private(&alice.id, ServerEvent::Pong).await, 1);
        assert_eq!(laptop_rx.recv().await, Some(ServerEvent::Pong));
        assert!(registry.is_registered(laptop_id).await);
        assert!(matches!(
            registry.join_private(phone.connection_id).await,
            Err(ChatError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn offline_principal_gets_nothing() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.notify_private(&"nobody".into(), ServerEvent::Pong).await, 0);
    }

    #[tokio::test]
    async fn session_events_are_published() {
        let registry = ConnectionRegistry::new();
        let mut sessions = registry.subscribe_sessions();
        let (outbox, _rx) = testing::outbox();

        let reg = registry.register(testing::principal("u1", "alice"), outbox).await;
        registry.unregister(reg.connection_id, CloseReason::Logout).await;

        assert_eq!(
            sessions.recv().await.unwrap(),
            SessionEvent::Opened {
                connection_id: reg.connection_id,
                principal_id: "u1".into()
            }
        );
        assert_eq!(
            sessions.recv().await.unwrap(),
            SessionEvent::Closed {
                connection_id: reg.connection_id,
                principal_id: "u1".into(),
                reason: CloseReason::Logout
            }
        );
    }

    #[tokio::test]
    async fn idle_connections_and_close() {
        let registry = ConnectionRegistry::new();
        let (outbox, _rx) = testing::outbox();
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reg = registry.register(testing::principal("u1", "alice"), outbox).await;

        assert!(registry.idle_since(start).await.is_empty());
        assert_eq!(registry.idle_since(Instant::now()).await, vec![reg.connection_id]);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let mid = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.touch(reg.connection_id).await;
        assert!(registry.idle_since(mid).await.is_empty());

        assert!(registry.close(reg.connection_id).await);
        tokio::time::timeout(Duration::from_secs(1), reg.closer.notified())
            .await
            .unwrap();
    }
}
