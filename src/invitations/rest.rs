use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::{
    auth::Authed,
    hub::ChatHub,
    model::{Invitation, InvitationStatus},
    protocol::{IncomingInvitation, ReplyInvitation},
    AppResult, ChatError,
};

#[derive(Deserialize)]
pub(crate) struct ReceivedQuery {
    status: Option<InvitationStatus>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn create(
    State(hub): State<Arc<ChatHub>>,
    Authed(inviter): Authed,
    Json(request): Json<IncomingInvitation>,
) -> AppResult<(StatusCode, Json<Invitation>)> {
    if request.inviter_id.as_ref().is_some_and(|id| id != &inviter.id) {
        return Err(ChatError::NotAuthorized("inviterId does not match the caller".into()).into());
    }

    let invitation = hub
        .invitations
        .create(&inviter, &request.recipient_id, &request.group_chat_id, &request.invite_reason)
        .await?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn sent(
    State(hub): State<Arc<ChatHub>>,
    Authed(principal): Authed,
) -> AppResult<Json<Vec<Invitation>>> {
    Ok(Json(hub.invitations.list_sent(&principal.id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn received(
    State(hub): State<Arc<ChatHub>>,
    Authed(principal): Authed,
    Query(ReceivedQuery { status }): Query<ReceivedQuery>,
) -> AppResult<Json<Vec<Invitation>>> {
    Ok(Json(hub.invitations.list_received(&principal.id, status).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn reply(
    State(hub): State<Arc<ChatHub>>,
    Authed(principal): Authed,
    Json(ReplyInvitation { invitation_id, status, deny_reason }): Json<ReplyInvitation>,
) -> AppResult<Json<Invitation>> {
    let invitation = hub
        .invitations
        .reply(&principal.id, invitation_id, status, deny_reason)
        .await?;
    Ok(Json(invitation))
}
