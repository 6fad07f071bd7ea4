//! Clients for the external user, group-chat and auth services, used when
//! `DIRECTORY_URL` is set.

mod auth;
mod directory;

use std::time::Duration;

use anyhow::{anyhow, bail};
use reqwest::{Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use auth::RestAuth;
pub use directory::RestDirectory;

use crate::{
    model::{Principal, PrincipalId},
    ChatError, ChatResult,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Whose token a request carries. A rejected caller token means the caller
/// is signed out; a rejected service token is the relay's own fault.
#[derive(Debug, Clone, Copy)]
pub enum Bearer<'a> {
    Caller(&'a str),
    Service(&'a str),
}

impl Bearer<'_> {
    fn token(&self) -> &str {
        match self {
            Bearer::Caller(token) | Bearer::Service(token) => token,
        }
    }
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
}

impl RestClient {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base)?;
        if base.cannot_be_a_base() {
            bail!("{base} cannot be used as a base url");
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `None` when the service answers 404.
    pub async fn get<T: DeserializeOwned>(&self, bearer: Bearer<'_>, segments: &[&str]) -> ChatResult<Option<T>> {
        let response = self
            .http
            .get(self.endpoint(segments))
            .bearer_auth(bearer.token())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response, bearer)?.json().await?))
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        bearer: Bearer<'_>,
        segments: &[&str],
        body: &B,
    ) -> ChatResult<Response> {
        let response = self
            .http
            .post(self.endpoint(segments))
            .bearer_auth(bearer.token())
            .json(body)
            .send()
            .await?;
        check(response, bearer)
    }
}

fn check(response: Response, bearer: Bearer<'_>) -> ChatResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    match status {
        StatusCode::UNAUTHORIZED => match bearer {
            Bearer::Caller(_) => Err(ChatError::Unauthenticated),
            Bearer::Service(_) => Err(anyhow!("{url} rejected the service token").into()),
        },
        StatusCode::CONFLICT => Err(ChatError::Validation(format!("{url} reported a conflict"))),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Err(ChatError::UpstreamUnavailable(format!("{s} from {url}")))
        }
        s => Err(anyhow!("unexpected {s} from {url}").into()),
    }
}

/// A user as the user service returns it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestUser {
    #[serde(rename = "_id", alias = "id")]
    id: PrincipalId,
    username: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

impl From<RestUser> for Principal {
    fn from(user: RestUser) -> Self {
        let full_name = [user.first_name.as_deref(), user.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let display_name = match user.display_name {
            Some(name) if !name.trim().is_empty() => name,
            _ if !full_name.is_empty() => full_name,
            _ => user.username.clone(),
        };

        Principal {
            id: user.id,
            display_name,
            username: user.username,
        }
    }
}

/// Serves `router` on a loopback port and returns its base url.
#[cfg(test)]
pub(crate) async fn mock_upstream(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}/api/v1")
}
