use axum::http::StatusCode;
use thiserror::Error;

use crate::model::{InvitationStatus, RoomId};

/// Failures of a chat action. Everything except `Unauthenticated` and
/// `MalformedFrame` is reported to the caller only and leaves the
/// connection open.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not a member of room {0}")]
    NotMember(RoomId),

    #[error("only the recipient may reply to this invitation")]
    NotRecipient,

    #[error("invitation cannot move from {from} to {to}")]
    InvalidTransition {
        from: InvitationStatus,
        to: InvitationStatus,
    },

    #[error("message body is empty")]
    EmptyBody,

    #[error("message body is longer than {max} characters")]
    BodyTooLong { max: usize },

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn code(&self) -> &'static str {
        use ChatError::*;
        match self {
            Unauthenticated => "unauthenticated",
            NotAuthorized(_) => "not_authorized",
            NotMember(_) => "not_member",
            NotRecipient => "not_recipient",
            InvalidTransition { .. } => "invalid_transition",
            EmptyBody => "empty_body",
            BodyTooLong { .. } => "body_too_long",
            Validation(_) => "validation",
            NotFound(_) => "not_found",
            UpstreamUnavailable(_) => "upstream_unavailable",
            MalformedFrame(_) => "malformed_frame",
            Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        use ChatError::*;
        match self {
            Unauthenticated => StatusCode::UNAUTHORIZED,
            NotAuthorized(_) | NotMember(_) | NotRecipient => StatusCode::FORBIDDEN,
            InvalidTransition { .. } => StatusCode::CONFLICT,
            EmptyBody | BodyTooLong { .. } | Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            NotFound(_) => StatusCode::NOT_FOUND,
            UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MalformedFrame(_) => StatusCode::BAD_REQUEST,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::UpstreamUnavailable(_))
    }

    /// Whether the connection that caused this error has to be dropped.
    pub fn closes_connection(&self) -> bool {
        matches!(self, ChatError::Unauthenticated | ChatError::MalformedFrame(_))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ChatError::UpstreamUnavailable(err.to_string())
            }
            err => ChatError::Internal(err.into()),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            return ChatError::Unauthenticated;
        }
        if err.is_decode() {
            return ChatError::Internal(err.into());
        }
        ChatError::UpstreamUnavailable(err.to_string())
    }
}
