use async_trait::async_trait;
use tracing::debug;

use crate::{auth::AuthService, model::Principal, ChatError, ChatResult};

use super::{Bearer, RestClient, RestUser};

/// Resolves a caller's token by asking the user service who it belongs to.
pub struct RestAuth {
    client: RestClient,
}

impl RestAuth {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AuthService for RestAuth {
    async fn authenticate(&self, token: &str) -> ChatResult<Principal> {
        let user: RestUser = self
            .client
            .get(Bearer::Caller(token), &["users", "me"])
            .await?
            .ok_or(ChatError::Unauthenticated)?;
        debug!(user = %user.id, "token accepted by user service");
        Ok(user.into())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use serde_json::{json, Value};

    use super::*;
    use crate::rest::mock_upstream;

    async fn me(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer good") => Ok(Json(json!({"_id": "u1", "username": "ada", "firstName": "Ada"}))),
            Some("Bearer flaky") => Err(StatusCode::BAD_GATEWAY),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }

    #[tokio::test]
    async fn maps_upstream_answers() {
        let base = mock_upstream(Router::new().route("/api/v1/users/me", get(me))).await;
        let auth = RestAuth::new(RestClient::new(&base).unwrap());

        let principal = auth.authenticate("good").await.unwrap();
        assert_eq!(principal.username, "ada");
        assert_eq!(principal.display_name, "Ada");

        assert!(matches!(auth.authenticate("bad").await, Err(ChatError::Unauthenticated)));
        assert!(matches!(auth.authenticate("flaky").await, Err(ChatError::UpstreamUnavailable(_))));
    }
}
