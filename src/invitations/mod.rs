//! Invitation handshake: `pending` moves exactly once to `accepted` or
//! `denied`. The store is authoritative; live notifications over private
//! channels are best-effort.

mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    routing::{get, patch, post},
    Router,
};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::{
    connections::ConnectionRegistry,
    directory::DirectoryBridge,
    model::{GroupChatId, Invitation, InvitationId, InvitationStatus, Principal, PrincipalId},
    protocol::ServerEvent,
    upstream::RetryPolicy,
    AppState, ChatError, ChatResult,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/invitations", post(rest::create))
        .route("/invitations/sent", get(rest::sent))
        .route("/invitations/received", get(rest::received))
        .route("/invitations/reply", patch(rest::reply))
}

#[async_trait]
pub trait InvitationStore: Send + Sync {
    async fn insert(&self, invitation: &Invitation) -> ChatResult<()>;
    async fn get(&self, id: InvitationId) -> ChatResult<Option<Invitation>>;
    /// Applies the resolution only if the invitation is still pending.
    /// Returns whether it was applied.
    async fn resolve(&self, resolved: &Invitation) -> ChatResult<bool>;
    async fn pending_for(
        &self,
        recipient: &PrincipalId,
        group: &GroupChatId,
    ) -> ChatResult<Option<Invitation>>;
    async fn list_sent(&self, inviter: &PrincipalId) -> ChatResult<Vec<Invitation>>;
    async fn list_received(
        &self,
        recipient: &PrincipalId,
        status: Option<InvitationStatus>,
    ) -> ChatResult<Vec<Invitation>>;
}

pub struct InvitationExchange {
    store: Arc<dyn InvitationStore>,
    directory: Arc<DirectoryBridge>,
    registry: Arc<ConnectionRegistry>,
    retry: RetryPolicy,
}

impl InvitationExchange {
    pub fn new(
        store: Arc<dyn InvitationStore>,
        directory: Arc<DirectoryBridge>,
        registry: Arc<ConnectionRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            retry,
        }
    }

    /// Records a pending invitation and tells the recipient if they are
    /// online. Offline recipients find it in their received listing.
    pub async fn create(
        &self,
        inviter: &Principal,
        recipient_id: &PrincipalId,
        group_chat_id: &GroupChatId,
        reason: &str,
    ) -> ChatResult<Invitation> {
        if &inviter.id == recipient_id {
            return Err(ChatError::Validation("cannot invite yourself".into()));
        }

        let recipient = self.directory.principal(recipient_id).await?;
        if !self.directory.is_member(group_chat_id, &inviter.id).await? {
            return Err(ChatError::NotAuthorized(format!(
                "only members of group chat {group_chat_id} can invite to it"
            )));
        }
        if self.directory.is_member(group_chat_id, &recipient.id).await? {
            return Err(ChatError::Validation(format!(
                "@{} is already a member of group chat {group_chat_id}",
                recipient.username
            )));
        }
        let already = self
            .retry
            .run("pending_for", || self.store.pending_for(&recipient.id, group_chat_id))
            .await?;
        if already.is_some() {
            return Err(ChatError::Validation(format!(
                "@{} already has a pending invitation to group chat {group_chat_id}",
                recipient.username
            )));
        }

        let invitation = Invitation::new(
            inviter.id.clone(),
            recipient.id.clone(),
            group_chat_id.clone(),
            reason.trim().to_owned(),
        );
        self.store.insert(&invitation).await?;

        let delivered = self
            .registry
            .notify_private(&recipient.id, ServerEvent::NewInvitation(invitation.clone()))
            .await;
        info!(
            invitation = %invitation.id,
            inviter = %inviter.id,
            recipient = %recipient.id,
            group = %group_chat_id,
            delivered,
            "invitation created"
        );
        Ok(invitation)
    }

    /// Accepts or denies a pending invitation on behalf of its recipient.
    /// Membership is granted only after the accepted status has won the
    /// guarded update, so a denied invitation never adds anyone.
    pub async fn reply(
        &self,
        replier: &PrincipalId,
        invitation_id: InvitationId,
        status: InvitationStatus,
        deny_reason: Option<String>,
    ) -> ChatResult<Invitation> {
        let current = self
            .retry
            .run("get_invitation", || self.store.get(invitation_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("invitation {invitation_id}")))?;

        if &current.recipient_id != replier {
            return Err(ChatError::NotRecipient);
        }

        let mut resolved = current.clone();
        resolved.resolve(status, deny_reason, OffsetDateTime::now_utc())?;

        if !self.store.resolve(&resolved).await? {
            let from = self
                .store
                .get(invitation_id)
                .await?
                .map_or(current.status, |inv| inv.status);
            return Err(ChatError::InvalidTransition { from, to: status });
        }

        if resolved.status == InvitationStatus::Accepted {
            let added = self
                .retry
                .run("add_member", || {
                    self.directory
                        .add_member(&resolved.group_chat_id, &resolved.recipient_id)
                })
                .await;
            if let Err(err) = added {
                error!(
                    invitation = %resolved.id,
                    group = %resolved.group_chat_id,
                    recipient = %resolved.recipient_id,
                    error = %err,
                    "invitation accepted but membership was not granted"
                );
                return Err(ChatError::UpstreamUnavailable(format!(
                    "invitation {} was accepted but group chat membership could not be granted",
                    resolved.id
                )));
            }
        }

        let delivered = self
            .registry
            .notify_private(&resolved.inviter_id, ServerEvent::ReceiveInvitation(resolved.clone()))
            .await;
        info!(
            invitation = %resolved.id,
            status = %resolved.status,
            delivered,
            "invitation resolved"
        );
        Ok(resolved)
    }

    pub async fn list_sent(&self, inviter: &PrincipalId) -> ChatResult<Vec<Invitation>> {
        self.retry.run("list_sent", || self.store.list_sent(inviter)).await
    }

    pub async fn list_received(
        &self,
        recipient: &PrincipalId,
        status: Option<InvitationStatus>,
    ) -> ChatResult<Vec<Invitation>> {
        let invitations = self
            .retry
            .run("list_received", || self.store.list_received(recipient, status))
            .await?;
        debug!(%recipient, ?status, count = invitations.len(), "received invitations");
        Ok(invitations)
    }
}
