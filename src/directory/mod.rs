//! Lookups against the user/group-chat directory.

mod invite_list;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

pub use invite_list::InviteList;

use crate::{
    model::{GroupChat, GroupChatId, Principal, PrincipalId},
    upstream::RetryPolicy,
    ChatError, ChatResult,
};

/// The service that owns users, group chats and group-chat membership.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_by_username(&self, username: &str) -> ChatResult<Option<Principal>>;
    async fn principal(&self, id: &PrincipalId) -> ChatResult<Option<Principal>>;
    async fn is_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<bool>;
    async fn group_chat(&self, id: &GroupChatId) -> ChatResult<Option<GroupChat>>;
    async fn create_group_chat(
        &self,
        name: &str,
        description: Option<&str>,
        owner: &PrincipalId,
    ) -> ChatResult<GroupChat>;
    /// Adding an existing member is not an error.
    async fn add_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<()>;
}

/// Retrying front for the directory. Reads go through the retry policy,
/// writes are attempted once.
pub struct DirectoryBridge {
    directory: Arc<dyn Directory>,
    retry: RetryPolicy,
}

impl DirectoryBridge {
    pub fn new(directory: Arc<dyn Directory>, retry: RetryPolicy) -> Self {
        Self { directory, retry }
    }

    pub async fn find_by_username(&self, username: &str) -> ChatResult<Principal> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ChatError::Validation("username is empty".into()));
        }

        let found = self
            .retry
            .run("find_by_username", || self.directory.find_by_username(username))
            .await?;
        debug!(%username, found = found.is_some(), "username lookup");
        found.ok_or_else(|| ChatError::NotFound(format!("user @{username}")))
    }

    pub async fn principal(&self, id: &PrincipalId) -> ChatResult<Principal> {
        self.retry
            .run("principal", || self.directory.principal(id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {id}")))
    }

    pub async fn is_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<bool> {
        self.retry
            .run("is_member", || self.directory.is_member(group, principal))
            .await
    }

    pub async fn group_chat(&self, id: &GroupChatId) -> ChatResult<GroupChat> {
        self.retry
            .run("group_chat", || self.directory.group_chat(id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("group chat {id}")))
    }

    pub async fn create_group_chat(
        &self,
        name: &str,
        description: Option<&str>,
        owner: &PrincipalId,
    ) -> ChatResult<GroupChat> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("group chat name is empty".into()));
        }
        let description = description.map(str::trim).filter(|d| !d.is_empty());
        self.directory.create_group_chat(name, description, owner).await
    }

    pub async fn add_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<()> {
        self.directory.add_member(group, principal).await
    }
}
