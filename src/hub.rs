use std::{sync::Arc, time::Instant};

use tracing::info;

use crate::{
    auth::AuthService,
    config::Config,
    connections::{CloseReason, ConnectionRegistry, Outbox, Registration},
    db::SqliteStore,
    directory::{Directory, DirectoryBridge},
    invitations::{InvitationExchange, InvitationStore},
    model::{ConnectionId, Principal},
    rooms::{msg::ChatHistory, msg::MessageRelay, RoomManager},
    upstream::RetryPolicy,
    ChatError, ChatResult,
};

/// The services the hub talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthService>,
    pub directory: Arc<dyn Directory>,
    pub history: Arc<dyn ChatHistory>,
    pub invitations: Arc<dyn InvitationStore>,
}

impl Collaborators {
    /// Everything answered by one SQLite store.
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            auth: store.clone(),
            directory: store.clone(),
            history: store.clone(),
            invitations: store,
        }
    }
}

/// Shared state behind every socket and REST handler.
pub struct ChatHub {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomManager>,
    pub relay: MessageRelay,
    pub invitations: InvitationExchange,
    pub directory: Arc<DirectoryBridge>,
    auth: Arc<dyn AuthService>,
    retry: RetryPolicy,
}

impl ChatHub {
    pub fn new(collaborators: Collaborators, config: &Config) -> Self {
        let retry = RetryPolicy::with_attempts(config.upstream_retries);
        let registry = Arc::new(ConnectionRegistry::new());
        let directory = Arc::new(DirectoryBridge::new(collaborators.directory, retry.clone()));
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&collaborators.history),
        ));
        let relay = MessageRelay::new(
            Arc::clone(&rooms),
            Arc::clone(&registry),
            collaborators.history,
            config.max_message_len,
        );
        let invitations = InvitationExchange::new(
            collaborators.invitations,
            Arc::clone(&directory),
            Arc::clone(&registry),
            retry.clone(),
        );

        Self {
            registry,
            rooms,
            relay,
            invitations,
            directory,
            auth: collaborators.auth,
            retry,
        }
    }

    pub async fn authenticate(&self, token: &str) -> ChatResult<Principal> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }
        self.retry.run("authenticate", || self.auth.authenticate(token)).await
    }

    /// Validates `token` and registers the connection for its principal.
    pub async fn connect(&self, token: &str, outbox: Outbox) -> ChatResult<Registration> {
        let principal = self.authenticate(token).await?;
        Ok(self.registry.register(principal, outbox).await)
    }

    /// Forgets the connection, then drops it from every room it joined.
    /// Unregistering first means a join still in flight for another device
    /// can no longer subscribe it. Safe to call more than once.
    pub async fn disconnect(&self, connection: ConnectionId, reason: CloseReason) {
        self.registry.unregister(connection, reason).await;
        self.rooms.detach(connection).await;
    }

    /// Closes connections that have been silent for longer than
    /// `idle_timeout`. Returns how many were closed.
    pub async fn reap_idle(&self, idle_timeout: std::time::Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(idle_timeout) else {
            return 0;
        };

        let idle = self.registry.idle_since(cutoff).await;
        for &connection in &idle {
            self.registry.close(connection).await;
            self.disconnect(connection, CloseReason::Idle).await;
        }
        if !idle.is_empty() {
            info!(count = idle.len(), "reaped idle connections");
        }
        idle.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        connections::SessionEvent,
        model::{GroupChat, GroupChatId, PrincipalId},
        rooms::JoinOutcome,
        testing::{self, World},
    };

    /// Holds the first membership check until released.
    struct GatedDirectory {
        store: SqliteStore,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Directory for GatedDirectory {
        async fn find_by_username(&self, username: &str) -> ChatResult<Option<Principal>> {
            self.store.find_by_username(username).await
        }

        async fn principal(&self, id: &PrincipalId) -> ChatResult<Option<Principal>> {
            self.store.principal(id).await
        }

        async fn is_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<bool> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.store.is_member(group, principal).await
        }

        async fn group_chat(&self, id: &GroupChatId) -> ChatResult<Option<GroupChat>> {
            self.store.group_chat(id).await
        }

        async fn create_group_chat(
            &self,
            name: &str,
            description: Option<&str>,
            owner: &PrincipalId,
        ) -> ChatResult<GroupChat> {
            self.store.create_group_chat(name, description, owner).await
        }

        async fn add_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<()> {
            self.store.add_member(group, principal).await
        }
    }

    async fn gated_world() -> (World, Arc<GatedDirectory>) {
        let store = testing::store().await;
        let gate = Arc::new(GatedDirectory {
            store: store.clone(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let collaborators = Collaborators {
            directory: gate.clone(),
            ..Collaborators::sqlite(store.clone())
        };
        (World::new(store, collaborators), gate)
    }

    #[tokio::test]
    async fn disconnect_cleans_rooms_and_registry() {
        let world = testing::world().await;
        let alice = world.user("alice").await;
        let chat = world.group("G1", &alice).await;
        let (conn, _rx) = world.connect(&alice).await;
        world.hub.rooms.join_room(conn, &chat.id).await.unwrap();
        let mut sessions = world.hub.registry.subscribe_sessions();

        world.hub.disconnect(conn, CloseReason::Disconnected).await;
        world.hub.disconnect(conn, CloseReason::Disconnected).await;

        assert!(!world.hub.registry.is_registered(conn).await);
        assert_eq!(world.hub.rooms.room_count().await, 0);
        assert_eq!(
            sessions.recv().await.unwrap(),
            SessionEvent::Closed {
                connection_id: conn,
                principal_id: alice.id.clone(),
                reason: CloseReason::Disconnected,
            }
        );
        assert!(sessions.try_recv().is_err());
    }

    #[tokio::test]
    async fn reaper_only_takes_silent_connections() {
        let world = testing::world().await;
        let alice = world.user("alice").await;
        let (quiet, _quiet_rx) = world.connect(&alice).await;
        let (chatty, _chatty_rx) = world.connect(&alice).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        world.hub.registry.touch(chatty).await;

        assert_eq!(world.hub.reap_idle(Duration::from_millis(40)).await, 1);
        assert!(!world.hub.registry.is_registered(quiet).await);
        assert!(world.hub.registry.is_registered(chatty).await);
    }

    #[tokio::test]
    async fn blank_tokens_never_reach_the_auth_service() {
        let world = testing::world().await;
        assert!(matches!(world.hub.authenticate("  ").await, Err(ChatError::Unauthenticated)));

        let alice = world.user("alice").await;
        let token = world.store.issue_token(&alice.id).await.unwrap();
        assert_eq!(world.hub.authenticate(&token).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn connect_rejects_bad_tokens() {
        let world = testing::world().await;
        let alice = world.user("alice").await;
        let token = world.store.issue_token(&alice.id).await.unwrap();

        let (outbox, _rx) = testing::outbox();
        let reg = world.hub.connect(&format!(" {token} "), outbox).await.unwrap();
        assert_eq!(reg.principal, alice);

        for bad in ["", "   ", "forged"] {
            let (outbox, _rx) = testing::outbox();
            assert!(matches!(
                world.hub.connect(bad, outbox).await,
                Err(ChatError::Unauthenticated)
            ));
        }
        assert_eq!(world.hub.registry.len().await, 1);
    }

    #[tokio::test]
    async fn device_dropped_during_a_join_is_not_left_behind() {
        let (world, gate) = gated_world().await;
        let alice = world.user("alice").await;
        let chat = world.group("G1", &alice).await;
        let (phone, _phone_rx) = world.connect(&alice).await;
        let (laptop, _laptop_rx) = world.connect(&alice).await;

        let hub = Arc::clone(&world.hub);
        let room_id = chat.id.clone();
        let join = tokio::spawn(async move { hub.rooms.join_room(laptop, &room_id).await });

        gate.entered.notified().await;
        world.hub.disconnect(phone, CloseReason::Disconnected).await;
        gate.release.notify_one();

        assert_eq!(join.await.unwrap().unwrap(), JoinOutcome::Joined { subscribed: 1 });
        assert!(world.hub.rooms.rooms_of(phone).await.is_empty());
        assert!(world.hub.rooms.is_subscribed(&chat.id, laptop).await);

        world.hub.disconnect(laptop, CloseReason::Disconnected).await;
        assert!(!world.hub.rooms.is_member(&chat.id, &alice.id).await);
        assert_eq!(world.hub.rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn unregistered_device_is_never_subscribed() {
        let (world, gate) = gated_world().await;
        let alice = world.user("alice").await;
        let chat = world.group("G1", &alice).await;
        let (phone, _phone_rx) = world.connect(&alice).await;
        let (laptop, _laptop_rx) = world.connect(&alice).await;

        let hub = Arc::clone(&world.hub);
        let room_id = chat.id.clone();
        let join = tokio::spawn(async move { hub.rooms.join_room(laptop, &room_id).await });

        // first half of a disconnect; the room detach has not run yet
        gate.entered.notified().await;
        world.hub.registry.unregister(phone, CloseReason::Disconnected).await;
        gate.release.notify_one();
        join.await.unwrap().unwrap();

        assert!(!world.hub.rooms.is_subscribed(&chat.id, phone).await);
        assert_eq!(
            world.hub.rooms.with_room(&chat.id, |room| room.subscriber_count()).await,
            Some(1)
        );
    }
}
