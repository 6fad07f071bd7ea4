use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::{
    connections::ConnectionRegistry,
    model::{ConnectionId, Message, MessageId, RoomId},
    protocol::ServerEvent,
    ChatError, ChatResult,
};

use super::RoomManager;

/// Durable storage for relayed messages.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    async fn append(&self, message: &Message) -> ChatResult<()>;
    /// The latest `limit` messages of a room, oldest first.
    async fn history(&self, room: &RoomId, limit: u32) -> ChatResult<Vec<Message>>;
    /// Highest stored sequence number of a room, 0 when it has none.
    async fn last_seq(&self, room: &RoomId) -> ChatResult<u64>;
}

pub struct MessageRelay {
    rooms: Arc<RoomManager>,
    registry: Arc<ConnectionRegistry>,
    history: Arc<dyn ChatHistory>,
    max_len: usize,
    persist_failures: Arc<AtomicU64>,
}

impl MessageRelay {
    pub fn new(
        rooms: Arc<RoomManager>,
        registry: Arc<ConnectionRegistry>,
        history: Arc<dyn ChatHistory>,
        max_len: usize,
    ) -> Self {
        Self {
            rooms,
            registry,
            history,
            max_len,
            persist_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamps the message and queues it on every connection subscribed to
    /// the room, the sender's own connections included. Persistence happens
    /// afterwards and its failure does not fail the send.
    pub async fn send(
        &self,
        connection: ConnectionId,
        room_id: &RoomId,
        body: &str,
        attachment: Option<String>,
    ) -> ChatResult<Message> {
        let sender = self
            .registry
            .principal_of(connection)
            .await
            .ok_or(ChatError::Unauthenticated)?;

        if !self.rooms.is_member(room_id, &sender.id).await {
            return Err(ChatError::NotMember(room_id.clone()));
        }

        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyBody);
        }
        if body.chars().count() > self.max_len {
            return Err(ChatError::BodyTooLong { max: self.max_len });
        }
        let attachment = attachment.filter(|a| !a.trim().is_empty());

        let (message, delivered) = self
            .rooms
            .with_room(room_id, |room| {
                if !room.has_member(&sender.id) {
                    return None;
                }
                let message = Message {
                    id: MessageId::new(),
                    room_id: room_id.clone(),
                    sender_id: sender.id.clone(),
                    body: body.to_owned(),
                    attachment,
                    sent_at: OffsetDateTime::now_utc(),
                    seq: room.next_seq(),
                };
                let delivered = room.broadcast(&ServerEvent::ReceiveMessage(message.clone()));
                Some((message, delivered))
            })
            .await
            .flatten()
            .ok_or_else(|| ChatError::NotMember(room_id.clone()))?;

        debug!(
            message_id = %message.id,
            room = %room_id,
            seq = message.seq,
            delivered,
            "message relayed"
        );
        self.persist(message.clone());
        Ok(message)
    }

    fn persist(&self, message: Message) {
        let history = Arc::clone(&self.history);
        let failures = Arc::clone(&self.persist_failures);
        tokio::spawn(async move {
            if let Err(err) = history.append(&message).await {
                let total = failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    message_id = %message.id,
                    room = %message.room_id,
                    error = %err,
                    total_failures = total,
                    "failed to persist message"
                );
            }
        });
    }

    /// Messages that were relayed but could not be stored.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn history(&self) -> &Arc<dyn ChatHistory> {
        &self.history
    }
}
