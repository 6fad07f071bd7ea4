//! Room membership and broadcast subscriptions.
//!
//! A room is the live channel of a group chat. Membership is verified with
//! the directory before anything is locked; each room's state sits behind
//! its own mutex, and broadcasts happen while it is held so every subscriber
//! sees the same order.

mod history;
pub mod msg;

use std::{collections::HashMap, sync::Arc};

use axum::{routing::get, Router};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use self::msg::ChatHistory;
use crate::{
    connections::{ConnectionRegistry, Outbox},
    directory::DirectoryBridge,
    model::{ConnectionId, PrincipalId, RoomId},
    protocol::ServerEvent,
    AppState, ChatError, ChatResult,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/chat-histories/chat/{chat_id}", get(history::chat_history))
}

pub struct Room {
    id: RoomId,
    members: HashMap<PrincipalId, HashMap<ConnectionId, Outbox>>,
    next_seq: u64,
    closed: bool,
}

impl Room {
    fn new(id: RoomId, last_seq: u64) -> Self {
        Self {
            id,
            members: HashMap::new(),
            next_seq: last_seq,
            closed: false,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn has_member(&self, principal: &PrincipalId) -> bool {
        self.members.contains_key(principal)
    }

    pub fn is_subscribed(&self, connection: ConnectionId) -> bool {
        self.members.values().any(|conns| conns.contains_key(&connection))
    }

    pub fn subscriber_count(&self) -> usize {
        self.members.values().map(HashMap::len).sum()
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Queues `event` on every subscribed connection.
    pub(crate) fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for outbox in self.members.values().flat_map(HashMap::values) {
            if outbox.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { subscribed: usize },
    AlreadyJoined,
}

#[derive(Default)]
struct Rooms {
    live: HashMap<RoomId, Arc<Mutex<Room>>>,
    /// Last sequence number of rooms that emptied, so a reopened room
    /// carries on where it stopped.
    retired: HashMap<RoomId, u64>,
}

pub struct RoomManager {
    rooms: RwLock<Rooms>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<DirectoryBridge>,
    history: Arc<dyn ChatHistory>,
}

impl RoomManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<DirectoryBridge>,
        history: Arc<dyn ChatHistory>,
    ) -> Self {
        Self {
            rooms: RwLock::new(Rooms::default()),
            registry,
            directory,
            history,
        }
    }

    /// Admits the connection's principal to the room and subscribes all of
    /// its live connections. Joining again from an already subscribed
    /// connection changes nothing.
    pub async fn join_room(&self, connection: ConnectionId, room_id: &RoomId) -> ChatResult<JoinOutcome> {
        let principal = self
            .registry
            .principal_of(connection)
            .await
            .ok_or(ChatError::Unauthenticated)?;

        if self.is_subscribed(room_id, connection).await {
            return Ok(JoinOutcome::AlreadyJoined);
        }

        // may include connections dropped while the directory answers;
        // those are filtered under the room lock below
        let outboxes = self.registry.outboxes_of(&principal.id).await;
        if !self.directory.is_member(room_id, &principal.id).await? {
            warn!(principal = %principal.id, room = %room_id, "join refused");
            return Err(ChatError::NotAuthorized(format!(
                "@{} is not a member of group chat {room_id}",
                principal.username
            )));
        }

        let subscribed = loop {
            let room = self.room_or_create(room_id).await;
            let mut room = room.lock().await;
            if room.closed {
                continue;
            }

            let mut subscribed = 0;
            for (id, outbox) in &outboxes {
                if !self.registry.is_registered(*id).await {
                    continue;
                }
                let conns = room.members.entry(principal.id.clone()).or_default();
                if conns.insert(*id, outbox.clone()).is_none() {
                    subscribed += 1;
                }
            }

            if !room.is_subscribed(connection) {
                // unregistered while we were checking the directory
                if room.members.get(&principal.id).is_some_and(HashMap::is_empty) {
                    room.members.remove(&principal.id);
                }
                drop(room);
                self.remove_if_empty(room_id).await;
                return Err(ChatError::Unauthenticated);
            }
            break subscribed;
        };

        info!(principal = %principal.id, room = %room_id, subscribed, "joined room");
        Ok(JoinOutcome::Joined { subscribed })
    }

    /// Removes the principal and all of its connections from the room.
    /// Leaving a room that was never joined is a no-op.
    pub async fn leave_room(&self, connection: ConnectionId, room_id: &RoomId) -> ChatResult<bool> {
        let principal = self
            .registry
            .principal_of(connection)
            .await
            .ok_or(ChatError::Unauthenticated)?;

        let Some(room) = self.room(room_id).await else {
            return Ok(false);
        };
        let left = room.lock().await.members.remove(&principal.id).is_some();
        if left {
            info!(principal = %principal.id, room = %room_id, "left room");
            self.remove_if_empty(room_id).await;
        }
        Ok(left)
    }

    /// Drops one connection from every room it was subscribed to, e.g. after
    /// its transport went away. A principal stays a member of a room as long
    /// as another of its connections is still subscribed there.
    pub async fn detach(&self, connection: ConnectionId) -> Vec<RoomId> {
        let rooms: Vec<_> = self.rooms.read().await.live.values().cloned().collect();

        let mut detached = Vec::new();
        let mut emptied = Vec::new();
        for room in rooms {
            let mut room = room.lock().await;
            let mut hit = false;
            room.members.retain(|_, conns| {
                hit |= conns.remove(&connection).is_some();
                !conns.is_empty()
            });
            if hit {
                detached.push(room.id.clone());
                if room.members.is_empty() {
                    emptied.push(room.id.clone());
                }
            }
        }

        for room_id in &emptied {
            self.remove_if_empty(room_id).await;
        }
        if !detached.is_empty() {
            debug!(%connection, rooms = detached.len(), "detached connection");
        }
        detached
    }

    /// Runs `f` with the room locked. `None` when nobody is in the room.
    pub(crate) async fn with_room<R>(&self, room_id: &RoomId, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        let room = self.room(room_id).await?;
        let mut room = room.lock().await;
        if room.closed {
            return None;
        }
        Some(f(&mut *room))
    }

    pub async fn is_member(&self, room_id: &RoomId, principal: &PrincipalId) -> bool {
        self.with_room(room_id, |room| room.has_member(principal))
            .await
            .unwrap_or(false)
    }

    pub async fn is_subscribed(&self, room_id: &RoomId, connection: ConnectionId) -> bool {
        self.with_room(room_id, |room| room.is_subscribed(connection))
            .await
            .unwrap_or(false)
    }

    pub async fn members(&self, room_id: &RoomId) -> Vec<PrincipalId> {
        let mut members = self
            .with_room(room_id, |room| room.members.keys().cloned().collect::<Vec<_>>())
            .await
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn rooms_of(&self, connection: ConnectionId) -> Vec<RoomId> {
        let rooms: Vec<_> = self.rooms.read().await.live.values().cloned().collect();
        let mut ids = Vec::new();
        for room in rooms {
            let room = room.lock().await;
            if room.is_subscribed(connection) {
                ids.push(room.id.clone());
            }
        }
        ids.sort();
        ids
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.live.len()
    }

    async fn room(&self, room_id: &RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.live.get(room_id).cloned()
    }

    async fn room_or_create(&self, room_id: &RoomId) -> Arc<Mutex<Room>> {
        if let Some(room) = self.room(room_id).await {
            return room;
        }

        let stored = match self.history.last_seq(room_id).await {
            Ok(seq) => seq,
            Err(err) => {
                warn!(room = %room_id, error = %err, "could not read the last stored sequence");
                0
            }
        };
        let mut rooms = self.rooms.write().await;
        let last_seq = rooms.retired.get(room_id).copied().unwrap_or(0).max(stored);
        Arc::clone(
            rooms
                .live
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id.clone(), last_seq)))),
        )
    }

    async fn remove_if_empty(&self, room_id: &RoomId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.live.get(room_id).cloned() else {
            return;
        };
        let mut room = room.lock().await;
        if room.members.is_empty() {
            room.closed = true;
            rooms.live.remove(room_id);
            rooms.retired.insert(room_id.clone(), room.next_seq);
            debug!(room = %room_id, "room dropped");
        }
    }
}
