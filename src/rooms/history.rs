use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{
    auth::Authed,
    hub::ChatHub,
    model::{GroupChatId, Message},
    AppResult, ChatError,
};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<u32>,
}

/// Stored messages of a group chat, oldest first. Live delivery never
/// replays these; clients fetch them here after joining.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_history(
    State(hub): State<Arc<ChatHub>>,
    Authed(principal): Authed,
    Path(chat_id): Path<GroupChatId>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    if !hub.directory.is_member(&chat_id, &principal.id).await? {
        return Err(ChatError::NotAuthorized(format!("not a member of group chat {chat_id}")).into());
    }

    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let messages = hub.relay.history().history(&chat_id, limit).await?;
    Ok(Json(messages))
}
