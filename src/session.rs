//! One authenticated socket: turns client events into hub calls and queues
//! the replies on the connection's own outbox.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    connections::{CloseReason, Outbox},
    directory::InviteList,
    hub::ChatHub,
    model::{ConnectionId, Invitation, Principal, PrincipalId},
    protocol::{ClientEvent, IncomingInvitation, InviteFoundUsers, ServerEvent},
    ChatError, ChatResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

pub struct Session {
    hub: Arc<ChatHub>,
    connection_id: ConnectionId,
    principal: Principal,
    outbox: Outbox,
    invite_list: InviteList,
}

impl Session {
    pub fn new(hub: Arc<ChatHub>, connection_id: ConnectionId, principal: Principal, outbox: Outbox) -> Self {
        Self {
            hub,
            connection_id,
            principal,
            outbox,
            invite_list: InviteList::new(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Parses and handles one text frame. A frame that is not a known
    /// event closes the connection after the error is queued.
    pub async fn handle_frame(&mut self, frame: &str) -> Flow {
        match ClientEvent::parse(frame) {
            Ok(event) => self.handle(event).await,
            Err(err) => {
                let name = serde_json::from_str::<serde_json::Value>(frame)
                    .ok()
                    .and_then(|v| v.get("event")?.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "unknown".to_owned());
                debug!(connection_id = %self.connection_id, event = %name, error = %err, "malformed frame");
                self.reply(ServerEvent::error(&name, &err));
                Flow::Close(CloseReason::MalformedFrame)
            }
        }
    }

    /// Handles one client event. Every rejected action is answered with an
    /// `error` event naming it.
    pub async fn handle(&mut self, event: ClientEvent) -> Flow {
        let name = event.name();
        match self.dispatch(event).await {
            Ok(flow) => flow,
            Err(err) => {
                if matches!(err, ChatError::Internal(_)) {
                    warn!(connection_id = %self.connection_id, event = name, error = ?err, "event failed");
                } else {
                    debug!(connection_id = %self.connection_id, event = name, error = %err, "event rejected");
                }
                self.reply(ServerEvent::error(name, &err));
                match err {
                    ChatError::Unauthenticated => Flow::Close(CloseReason::Unauthenticated),
                    ChatError::MalformedFrame(_) => Flow::Close(CloseReason::MalformedFrame),
                    _ => Flow::Continue,
                }
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> ChatResult<Flow> {
        let hub = Arc::clone(&self.hub);
        let conn = self.connection_id;

        match event {
            ClientEvent::Authenticate { .. } => {
                return Err(ChatError::Validation("connection is already authenticated".into()));
            }
            ClientEvent::JoinRoom(req) => {
                self.check_claim(req.user_id.as_ref())?;
                hub.rooms.join_room(conn, &req.room_id).await?;
                self.reply(ServerEvent::RoomJoined { room_id: req.room_id });
            }
            ClientEvent::LeaveRoom(req) => {
                self.check_claim(req.user_id.as_ref())?;
                hub.rooms.leave_room(conn, &req.room_id).await?;
                self.reply(ServerEvent::RoomLeft { room_id: req.room_id });
            }
            ClientEvent::SendMessage(req) => {
                self.check_claim(req.user_id.as_ref())?;
                hub.relay
                    .send(conn, &req.group_chat_id, &req.message, req.attachment)
                    .await?;
            }
            ClientEvent::FindUserByUsername(query) => {
                let found = hub.directory.find_by_username(query.username()).await?;
                self.invite_list.insert(found.clone());
                self.reply(ServerEvent::UserFound(found));
            }
            ClientEvent::IncomingInvitation(req) => {
                let outcome = match self.check_claim(req.inviter_id.as_ref()) {
                    Ok(()) => self.invite(&req).await,
                    Err(err) => Err(err),
                };
                self.reply_invitation(&req, outcome);
            }
            ClientEvent::ReplyInvitation(req) => {
                let resolved = hub
                    .invitations
                    .reply(&self.principal.id, req.invitation_id, req.status, req.deny_reason)
                    .await?;
                self.reply(ServerEvent::SuccessInvitation(resolved));
            }
            ClientEvent::InviteFoundUsers(req) => self.invite_found_users(req).await,
            ClientEvent::CreateGroupChat(req) => {
                let chat = hub
                    .directory
                    .create_group_chat(&req.name, req.description.as_deref(), &self.principal.id)
                    .await?;
                self.reply(ServerEvent::GroupChatCreated(chat));
            }
            ClientEvent::JoinPrivateRoom(req) => {
                self.check_claim(req.user_id.as_ref())?;
                hub.registry.join_private(conn).await?;
            }
            ClientEvent::Ping => self.reply(ServerEvent::Pong),
            ClientEvent::Logout => return Ok(Flow::Close(CloseReason::Logout)),
        }
        Ok(Flow::Continue)
    }

    async fn invite(&self, req: &IncomingInvitation) -> ChatResult<Invitation> {
        self.hub
            .invitations
            .create(&self.principal, &req.recipient_id, &req.group_chat_id, &req.invite_reason)
            .await
    }

    /// Invites everyone found since the last batch and empties the list.
    async fn invite_found_users(&mut self, req: InviteFoundUsers) {
        if let Some(usernames) = &req.usernames {
            self.invite_list.retain_usernames(usernames);
        }

        for recipient in self.invite_list.drain() {
            let single = IncomingInvitation {
                inviter_id: Some(self.principal.id.clone()),
                recipient_id: recipient.id,
                group_chat_id: req.group_chat_id.clone(),
                invite_reason: req.invite_reason.clone(),
            };
            let outcome = self.invite(&single).await;
            self.reply_invitation(&single, outcome);
        }
    }

    fn reply_invitation(&self, req: &IncomingInvitation, outcome: ChatResult<Invitation>) {
        match outcome {
            Ok(invitation) => self.reply(ServerEvent::SuccessInvitation(invitation)),
            Err(err) => {
                debug!(connection_id = %self.connection_id, error = %err, "invitation rejected");
                self.reply(ServerEvent::invitation_error(req, &err));
            }
        }
    }

    /// Clients may name the acting user; it has to be the authenticated one.
    fn check_claim(&self, claimed: Option<&PrincipalId>) -> ChatResult<()> {
        match claimed {
            Some(id) if id != &self.principal.id => Err(ChatError::NotAuthorized(format!(
                "connection is authenticated as {}, not {id}",
                self.principal.id
            ))),
            _ => Ok(()),
        }
    }

    fn reply(&self, event: ServerEvent) {
        let _ = self.outbox.send(event);
    }
}
