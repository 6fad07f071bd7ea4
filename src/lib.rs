pub mod appresult;
pub mod auth;
pub mod config;
pub mod connections;
pub mod db;
pub mod directory;
pub mod error;
pub mod hub;
pub mod invitations;
pub mod model;
pub mod protocol;
pub mod rest;
pub mod rooms;
pub mod server;
pub mod session;
pub mod upstream;
mod ws;

use std::sync::Arc;

use anyhow::anyhow;
use axum::extract::FromRef;
use serde_json::Value;

pub use appresult::{AppError, AppResult};
pub use error::{ChatError, ChatResult};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Arc<hub::ChatHub>,
    pub config: Arc<config::Config>,
}

/// Field access on loosely shaped upstream JSON. A missing or mistyped
/// field is an internal error.
pub trait GetField {
    fn get_str_field(&self, field: &str) -> ChatResult<String>;
    fn get_obj_field(&self, field: &str) -> ChatResult<&Value>;
}

impl GetField for Value {
    fn get_str_field(&self, field: &str) -> ChatResult<String> {
        Ok(self
            .get_obj_field(field)?
            .as_str()
            .ok_or_else(|| anyhow!("expected {field} in {self} to be string"))?
            .to_owned())
    }

    fn get_obj_field(&self, field: &str) -> ChatResult<&Value> {
        self.get(field)
            .ok_or_else(|| anyhow!("expected {field} in {self}").into())
    }
}
