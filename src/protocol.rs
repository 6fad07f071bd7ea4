//! Named events exchanged over `/ws`. Every frame is a JSON text message of
//! the form `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    model::{
        ConnectionId, GroupChat, GroupChatId, Invitation, InvitationId, InvitationStatus,
        Message, Principal, PrincipalId, RoomId,
    },
    ChatError,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Authenticate { token: String },
    JoinRoom(RoomRequest),
    LeaveRoom(RoomRequest),
    SendMessage(SendMessage),
    FindUserByUsername(UsernameQuery),
    IncomingInvitation(IncomingInvitation),
    ReplyInvitation(ReplyInvitation),
    InviteFoundUsers(InviteFoundUsers),
    CreateGroupChat(CreateGroupChat),
    JoinPrivateRoom(PrivateRoomRequest),
    Ping,
    Logout,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        use ClientEvent::*;
        match self {
            Authenticate { .. } => "authenticate",
            JoinRoom(_) => "join-room",
            LeaveRoom(_) => "leave-room",
            SendMessage(_) => "send-message",
            FindUserByUsername(_) => "find-user-by-username",
            IncomingInvitation(_) => "incoming-invitation",
            ReplyInvitation(_) => "reply-invitation",
            InviteFoundUsers(_) => "invite-found-users",
            CreateGroupChat(_) => "create-group-chat",
            JoinPrivateRoom(_) => "join-private-room",
            Ping => "ping",
            Logout => "logout",
        }
    }

    pub fn parse(frame: &str) -> Result<Self, ChatError> {
        serde_json::from_str(frame).map_err(|e| ChatError::MalformedFrame(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: Option<PrincipalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub group_chat_id: RoomId,
    #[serde(default)]
    pub user_id: Option<PrincipalId>,
    pub message: String,
    #[serde(default)]
    pub attachment: Option<String>,
}

/// Older clients emit the bare username string instead of an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UsernameQuery {
    Plain(String),
    Named { username: String },
}

impl UsernameQuery {
    pub fn username(&self) -> &str {
        match self {
            UsernameQuery::Plain(username) | UsernameQuery::Named { username } => username,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingInvitation {
    #[serde(default)]
    pub inviter_id: Option<PrincipalId>,
    pub recipient_id: PrincipalId,
    pub group_chat_id: GroupChatId,
    #[serde(default)]
    pub invite_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyInvitation {
    pub invitation_id: InvitationId,
    pub status: InvitationStatus,
    #[serde(default)]
    pub deny_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteFoundUsers {
    pub group_chat_id: GroupChatId,
    #[serde(default)]
    pub invite_reason: String,
    /// The usernames still in the composed list. Found users missing from
    /// it are dropped before inviting.
    #[serde(default)]
    pub usernames: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupChat {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateRoomRequest {
    #[serde(default)]
    pub user_id: Option<PrincipalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub event: String,
    pub code: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(event: &str, err: &ChatError) -> Self {
        Self {
            event: event.to_owned(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Authenticated {
        connection_id: ConnectionId,
        user: Principal,
    },
    ReceiveMessage(Message),
    UserFound(Principal),
    NewInvitation(Invitation),
    ReceiveInvitation(Invitation),
    SuccessInvitation(Invitation),
    ErrorInvitation {
        invitation: Value,
        error: ErrorBody,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: RoomId },
    GroupChatCreated(GroupChat),
    Pong,
    Error(ErrorBody),
}

impl ServerEvent {
    pub fn error(event: &str, err: &ChatError) -> Self {
        ServerEvent::Error(ErrorBody::new(event, err))
    }

    pub fn invitation_error(request: &impl Serialize, err: &ChatError) -> Self {
        ServerEvent::ErrorInvitation {
            invitation: serde_json::to_value(request).unwrap_or(Value::Null),
            error: ErrorBody::new("incoming-invitation", err),
        }
    }
}
