use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use crate::{hub::ChatHub, model::Principal, AppError, ChatError, ChatResult};

/// Validates bearer tokens issued by the external auth service.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authenticate(&self, token: &str) -> ChatResult<Principal>;
}

/// Pulls the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> ChatResult<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ChatError::Unauthenticated)?;

    let (scheme, token) = value.split_once(' ').ok_or(ChatError::Unauthenticated)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(ChatError::Unauthenticated);
    }
    Ok(token.trim())
}

/// The principal behind a bearer-authenticated REST request.
pub struct Authed(pub Principal);

impl<S> FromRequestParts<S> for Authed
where
    Arc<ChatHub>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let hub = Arc::<ChatHub>::from_ref(state);
        let token = bearer_token(&parts.headers)?;
        Ok(Authed(hub.authenticate(token).await?))
    }
}
