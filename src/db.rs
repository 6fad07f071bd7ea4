//! SQLite backing for everything the relay persists or looks up when it runs
//! standalone: principals and tokens, group chats and their members, chat
//! history and invitations.

use std::str::FromStr;

use async_trait::async_trait;
use rand::{distr::Alphanumeric, Rng};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use time::OffsetDateTime;
use tracing::info;

use crate::{
    auth::AuthService,
    directory::Directory,
    invitations::InvitationStore,
    model::{
        GroupChat, GroupChatId, Invitation, InvitationId, InvitationStatus, Message, MessageId,
        Principal, PrincipalId, RoomId,
    },
    rooms::msg::ChatHistory,
    ChatError, ChatResult,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tokens (
        token TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id)
    )",
    "CREATE TABLE IF NOT EXISTS group_chats (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_to_groups (
        group_chat_id TEXT NOT NULL REFERENCES group_chats(id),
        user_id TEXT NOT NULL REFERENCES users(id),
        PRIMARY KEY (group_chat_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS chat_histories (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        body TEXT NOT NULL,
        attachment TEXT,
        created_at INTEGER NOT NULL,
        seq INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS chat_histories_room ON chat_histories (room_id, created_at, seq)",
    "CREATE TABLE IF NOT EXISTS invitations (
        id TEXT PRIMARY KEY,
        inviter_id TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        group_chat_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        status TEXT NOT NULL,
        deny_reason TEXT,
        created_at INTEGER NOT NULL,
        resolved_at INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS invitations_one_pending
        ON invitations (recipient_id, group_chat_id) WHERE status = 'pending'",
];

const INVITATION_COLUMNS: &str = "id, inviter_id, recipient_id, group_chat_id, reason, status, deny_reason, created_at, resolved_at";

type InvitationRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
);

type MessageRow = (String, String, String, String, Option<String>, i64, i64);

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the database and makes sure the schema exists. In-memory
    /// databases live on a single connection that is never recycled.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(16)
        }
        .connect_with(options)
        .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(url, "database ready");
        Ok(Self { pool })
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> ChatResult<Principal> {
        let principal = Principal {
            id: PrincipalId(uuid::Uuid::now_v7().to_string()),
            display_name: display_name.to_owned(),
            username: username.to_owned(),
        };
        sqlx::query("INSERT INTO users (id,username,display_name) VALUES (?,?,?)")
            .bind(principal.id.as_str())
            .bind(&principal.username)
            .bind(&principal.display_name)
            .execute(&self.pool)
            .await?;
        Ok(principal)
    }

    pub async fn issue_token(&self, user_id: &PrincipalId) -> ChatResult<String> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        sqlx::query("INSERT INTO tokens (token,user_id) VALUES (?,?)")
            .bind(&token)
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(token)
    }
}

fn nanos(at: OffsetDateTime) -> i64 {
    at.unix_timestamp_nanos() as i64
}

fn from_nanos(nanos: i64) -> ChatResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos.into())
        .map_err(|e| ChatError::Internal(e.into()))
}

fn invitation_from_row(row: InvitationRow) -> ChatResult<Invitation> {
    let (id, inviter_id, recipient_id, group_chat_id, reason, status, deny_reason, created_at, resolved_at) = row;
    Ok(Invitation {
        id: InvitationId::from_str(&id).map_err(|e| ChatError::Internal(e.into()))?,
        inviter_id: inviter_id.into(),
        recipient_id: recipient_id.into(),
        group_chat_id: group_chat_id.into(),
        reason,
        status: status.parse()?,
        deny_reason,
        created_at: from_nanos(created_at)?,
        resolved_at: resolved_at.map(from_nanos).transpose()?,
    })
}

fn message_from_row(row: MessageRow) -> ChatResult<Message> {
    let (id, room_id, user_id, body, attachment, created_at, seq) = row;
    Ok(Message {
        id: MessageId::from_str(&id).map_err(|e| ChatError::Internal(e.into()))?,
        room_id: room_id.into(),
        sender_id: user_id.into(),
        body,
        attachment,
        sent_at: from_nanos(created_at)?,
        seq: seq as u64,
    })
}

#[async_trait]
impl AuthService for SqliteStore {
    async fn authenticate(&self, token: &str) -> ChatResult<Principal> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT users.id, users.username, users.display_name
             FROM tokens JOIN users ON users.id = tokens.user_id
             WHERE tokens.token=?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let (id, username, display_name) = row.ok_or(ChatError::Unauthenticated)?;
        Ok(Principal {
            id: id.into(),
            display_name,
            username,
        })
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn find_by_username(&self, username: &str) -> ChatResult<Option<Principal>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, username, display_name FROM users WHERE username=?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, username, display_name)| Principal {
            id: id.into(),
            display_name,
            username,
        }))
    }

    async fn principal(&self, id: &PrincipalId) -> ChatResult<Option<Principal>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT username, display_name FROM users WHERE id=?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(username, display_name)| Principal {
            id: id.clone(),
            display_name,
            username,
        }))
    }

    async fn is_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM user_to_groups WHERE group_chat_id=? AND user_id=?")
                .bind(group.as_str())
                .bind(principal.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn group_chat(&self, id: &GroupChatId) -> ChatResult<Option<GroupChat>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT name, description FROM group_chats WHERE id=?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(name, description)| GroupChat {
            id: id.clone(),
            name,
            description,
        }))
    }

    async fn create_group_chat(
        &self,
        name: &str,
        description: Option<&str>,
        owner: &PrincipalId,
    ) -> ChatResult<GroupChat> {
        let chat = GroupChat {
            id: GroupChatId(uuid::Uuid::now_v7().to_string()),
            name: name.to_owned(),
            description: description.map(str::to_owned),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO group_chats (id,name,description) VALUES (?,?,?)")
            .bind(chat.id.as_str())
            .bind(&chat.name)
            .bind(chat.description.as_deref())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO user_to_groups (group_chat_id,user_id) VALUES (?,?)")
            .bind(chat.id.as_str())
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(chat)
    }

    async fn add_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<()> {
        sqlx::query("INSERT OR IGNORE INTO user_to_groups (group_chat_id,user_id) VALUES (?,?)")
            .bind(group.as_str())
            .bind(principal.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatHistory for SqliteStore {
    async fn append(&self, message: &Message) -> ChatResult<()> {
        sqlx::query(
            "INSERT INTO chat_histories (id,room_id,user_id,body,attachment,created_at,seq)
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(message.id.to_string())
        .bind(message.room_id.as_str())
        .bind(message.sender_id.as_str())
        .bind(&message.body)
        .bind(message.attachment.as_deref())
        .bind(nanos(message.sent_at))
        .bind(message.seq as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn history(&self, room: &RoomId, limit: u32) -> ChatResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, room_id, user_id, body, attachment, created_at, seq
             FROM chat_histories WHERE room_id=?
             ORDER BY created_at DESC, seq DESC LIMIT ?",
        )
        .bind(room.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<ChatResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn last_seq(&self, room: &RoomId) -> ChatResult<u64> {
        let (last,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM chat_histories WHERE room_id=?")
            .bind(room.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(last.map_or(0, |seq| seq.max(0) as u64))
    }
}

#[async_trait]
impl InvitationStore for SqliteStore {
    async fn insert(&self, invitation: &Invitation) -> ChatResult<()> {
        sqlx::query(&format!(
            "INSERT INTO invitations ({INVITATION_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?)"
        ))
        .bind(invitation.id.to_string())
        .bind(invitation.inviter_id.as_str())
        .bind(invitation.recipient_id.as_str())
        .bind(invitation.group_chat_id.as_str())
        .bind(&invitation.reason)
        .bind(invitation.status.as_str())
        .bind(invitation.deny_reason.as_deref())
        .bind(nanos(invitation.created_at))
        .bind(invitation.resolved_at.map(nanos))
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => ChatError::Validation(format!(
                "{} already has a pending invitation to group chat {}",
                invitation.recipient_id, invitation.group_chat_id
            )),
            err => err.into(),
        })?;
        Ok(())
    }

    async fn get(&self, id: InvitationId) -> ChatResult<Option<Invitation>> {
        let row: Option<InvitationRow> =
            sqlx::query_as(&format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE id=?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(invitation_from_row).transpose()
    }

    async fn resolve(&self, resolved: &Invitation) -> ChatResult<bool> {
        let result = sqlx::query(
            "UPDATE invitations SET status=?, deny_reason=?, resolved_at=?
             WHERE id=? AND status=?",
        )
        .bind(resolved.status.as_str())
        .bind(resolved.deny_reason.as_deref())
        .bind(resolved.resolved_at.map(nanos))
        .bind(resolved.id.to_string())
        .bind(InvitationStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_for(
        &self,
        recipient: &PrincipalId,
        group: &GroupChatId,
    ) -> ChatResult<Option<Invitation>> {
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations
             WHERE recipient_id=? AND group_chat_id=? AND status=? LIMIT 1"
        ))
        .bind(recipient.as_str())
        .bind(group.as_str())
        .bind(InvitationStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(invitation_from_row).transpose()
    }

    async fn list_sent(&self, inviter: &PrincipalId) -> ChatResult<Vec<Invitation>> {
        let rows: Vec<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE inviter_id=? ORDER BY created_at, id"
        ))
        .bind(inviter.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(invitation_from_row).collect()
    }

    async fn list_received(
        &self,
        recipient: &PrincipalId,
        status: Option<InvitationStatus>,
    ) -> ChatResult<Vec<Invitation>> {
        let rows: Vec<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations
             WHERE recipient_id=? AND (? IS NULL OR status=?)
             ORDER BY created_at, id"
        ))
        .bind(recipient.as_str())
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(invitation_from_row).collect()
    }
}
