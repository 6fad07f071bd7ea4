use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{ChatError, ChatResult};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(PrincipalId);
string_id!(GroupChatId);

/// A room is the live side of a group chat and shares its id.
pub type RoomId = GroupChatId;

uuid_id!(ConnectionId);
uuid_id!(MessageId);
uuid_id!(InvitationId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(rename = "_id", alias = "id")]
    pub id: PrincipalId,
    pub display_name: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChat {
    #[serde(rename = "_id", alias = "id")]
    pub id: GroupChatId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A chat message as relayed to room subscribers. `seq` orders messages
/// within one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    #[serde(rename = "userId")]
    pub sender_id: PrincipalId,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(rename = "createAt", with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Denied,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Denied => "denied",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvitationStatus {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvitationStatus::Pending),
            "accepted" => Ok(InvitationStatus::Accepted),
            "denied" => Ok(InvitationStatus::Denied),
            other => Err(ChatError::Validation(format!("unknown invitation status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    #[serde(rename = "_id")]
    pub id: InvitationId,
    pub inviter_id: PrincipalId,
    pub recipient_id: PrincipalId,
    pub group_chat_id: GroupChatId,
    #[serde(rename = "inviteReason")]
    pub reason: String,
    pub status: InvitationStatus,
    #[serde(default)]
    pub deny_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl Invitation {
    pub fn new(
        inviter_id: PrincipalId,
        recipient_id: PrincipalId,
        group_chat_id: GroupChatId,
        reason: String,
    ) -> Self {
        Self {
            id: InvitationId::new(),
            inviter_id,
            recipient_id,
            group_chat_id,
            reason,
            status: InvitationStatus::Pending,
            deny_reason: None,
            created_at: OffsetDateTime::now_utc(),
            resolved_at: None,
        }
    }

    /// Moves a pending invitation to a terminal status. A deny reason is only
    /// kept for denials.
    pub fn resolve(
        &mut self,
        status: InvitationStatus,
        deny_reason: Option<String>,
        at: OffsetDateTime,
    ) -> ChatResult<()> {
        if self.status.is_terminal() || !status.is_terminal() {
            return Err(ChatError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        self.deny_reason = match status {
            InvitationStatus::Denied => deny_reason.filter(|r| !r.trim().is_empty()),
            _ => None,
        };
        self.resolved_at = Some(at);
        Ok(())
    }
}
