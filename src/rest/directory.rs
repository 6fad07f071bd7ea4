use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    directory::Directory,
    model::{GroupChat, GroupChatId, Principal, PrincipalId},
    ChatError, ChatResult, GetField,
};

use super::{Bearer, RestClient, RestUser};

/// Directory backed by the user and group-chat services, called with the
/// relay's own service token.
pub struct RestDirectory {
    client: RestClient,
    service_token: String,
}

impl RestDirectory {
    pub fn new(client: RestClient, service_token: String) -> Self {
        Self {
            client,
            service_token,
        }
    }

    async fn groups_of(&self, principal: &PrincipalId) -> ChatResult<Vec<GroupChatId>> {
        let entries: Vec<Value> = self
            .client
            .get(
                Bearer::Service(&self.service_token),
                &["user-to-groups", "groups", principal.as_str()],
            )
            .await?
            .unwrap_or_default();

        entries.iter().map(group_of_entry).collect()
    }
}

/// Membership entries carry the group either populated or as a bare id.
fn group_of_entry(entry: &Value) -> ChatResult<GroupChatId> {
    let group = entry.get_obj_field("groupChatId")?;
    match group.as_str() {
        Some(id) => Ok(id.into()),
        None => Ok(group.get_str_field("_id")?.into()),
    }
}

#[async_trait]
impl Directory for RestDirectory {
    async fn find_by_username(&self, username: &str) -> ChatResult<Option<Principal>> {
        let user: Option<RestUser> = self
            .client
            .get(Bearer::Service(&self.service_token), &["users", "username", username])
            .await?;
        Ok(user.map(Principal::from))
    }

    async fn principal(&self, id: &PrincipalId) -> ChatResult<Option<Principal>> {
        let user: Option<RestUser> = self
            .client
            .get(Bearer::Service(&self.service_token), &["users", id.as_str()])
            .await?;
        Ok(user.map(Principal::from))
    }

    async fn is_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<bool> {
        Ok(self.groups_of(principal).await?.contains(group))
    }

    async fn group_chat(&self, id: &GroupChatId) -> ChatResult<Option<GroupChat>> {
        self.client
            .get(Bearer::Service(&self.service_token), &["group-chats", id.as_str()])
            .await
    }

    async fn create_group_chat(
        &self,
        name: &str,
        description: Option<&str>,
        owner: &PrincipalId,
    ) -> ChatResult<GroupChat> {
        let chat: GroupChat = self
            .client
            .post(
                Bearer::Service(&self.service_token),
                &["group-chats"],
                &json!({ "name": name, "description": description, "ownerId": owner }),
            )
            .await?
            .json()
            .await?;
        self.add_member(&chat.id, owner).await?;
        Ok(chat)
    }

    async fn add_member(&self, group: &GroupChatId, principal: &PrincipalId) -> ChatResult<()> {
        let added = self
            .client
            .post(
                Bearer::Service(&self.service_token),
                &["user-to-groups"],
                &json!({ "userId": principal, "groupChatId": group }),
            )
            .await;
        match added {
            Ok(_) | Err(ChatError::Validation(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };

    use super::*;
    use crate::rest::mock_upstream;

    type Members = Arc<Mutex<Vec<(String, String)>>>;

    async fn groups(Path(user): Path<String>, State(members): State<Members>) -> Json<Value> {
        let members = members.lock().unwrap();
        let entries: Vec<Value> = members
            .iter()
            .filter(|(_, u)| *u == user)
            .enumerate()
            .map(|(i, (g, _))| {
                if i % 2 == 0 {
                    json!({ "groupChatId": { "_id": g, "name": "populated" } })
                } else {
                    json!({ "groupChatId": g })
                }
            })
            .collect();
        Json(Value::Array(entries))
    }

    async fn add(State(members): State<Members>, Json(body): Json<Value>) -> StatusCode {
        let group = body.get_str_field("groupChatId").unwrap();
        let user = body.get_str_field("userId").unwrap();
        let mut members = members.lock().unwrap();
        if members.contains(&(group.clone(), user.clone())) {
            return StatusCode::CONFLICT;
        }
        members.push((group, user));
        StatusCode::CREATED
    }

    async fn user_by_name(Path(username): Path<String>) -> Result<Json<Value>, StatusCode> {
        match username.as_str() {
            "bob" => Ok(Json(json!({ "_id": "u2", "username": "bob", "lastName": "Builder" }))),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn directory() -> RestDirectory {
        let members: Members = Arc::new(Mutex::new(vec![("g1".into(), "u1".into())]));
        let router = Router::new()
            .route("/api/v1/user-to-groups/groups/{user}", get(groups))
            .route("/api/v1/user-to-groups", post(add))
            .route("/api/v1/users/username/{username}", get(user_by_name))
            .with_state(members);
        let base = mock_upstream(router).await;
        RestDirectory::new(RestClient::new(&base).unwrap(), "service".into())
    }

    #[tokio::test]
    async fn membership_reads_both_entry_shapes() {
        let directory = directory().await;
        let (g1, g2): (GroupChatId, GroupChatId) = ("g1".into(), "g2".into());
        let u1: PrincipalId = "u1".into();

        directory.add_member(&g2, &u1).await.unwrap();
        directory.add_member(&g2, &u1).await.unwrap();

        assert!(directory.is_member(&g1, &u1).await.unwrap());
        assert!(directory.is_member(&g2, &u1).await.unwrap());
        assert!(!directory.is_member(&g1, &"u2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_usernames_are_none() {
        let directory = directory().await;
        let bob = directory.find_by_username("bob").await.unwrap().unwrap();
        assert_eq!(bob.display_name, "Builder");
        assert!(directory.find_by_username("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_service_token_does_not_sign_callers_out() {
        let router = Router::new().route(
            "/api/v1/user-to-groups/groups/{user}",
            get(|| async { StatusCode::UNAUTHORIZED }),
        );
        let base = mock_upstream(router).await;
        let directory = RestDirectory::new(RestClient::new(&base).unwrap(), "expired".into());

        let err = directory.is_member(&"g1".into(), &"u1".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::Internal(_)));
        assert!(!err.closes_connection());
    }

    #[test]
    fn malformed_entries_are_internal_errors() {
        assert!(matches!(group_of_entry(&json!({})), Err(ChatError::Internal(_))));
        assert!(matches!(
            group_of_entry(&json!({ "groupChatId": { "name": "no id" } })),
            Err(ChatError::Internal(_))
        ));
    }
}
