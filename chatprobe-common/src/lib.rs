//! Mattermost wire model shared by the platform client and the probes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type emitted by the platform when a post is created in a channel.
pub const EVENT_POSTED: &str = "posted";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub create_at: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventBroadcast {
    pub channel_id: String,
    pub user_id: String,
    pub team_id: String,
}

/// A frame received on the platform websocket.
///
/// Payload fields under `data` are loosely typed on the wire; accessors below
/// turn them into checked values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WebSocketEvent {
    pub event: String,
    pub data: Map<String, Value>,
    pub broadcast: EventBroadcast,
    pub seq: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event has no `{0}` field")]
    MissingField(&'static str),
    #[error("event field `{0}` has unexpected type")]
    WrongType(&'static str),
    #[error("event field `post` is not a valid post: {0}")]
    InvalidPost(#[from] serde_json::Error),
}

impl WebSocketEvent {
    /// Responses to client actions carry no `event` name.
    pub fn is_reply(&self) -> bool {
        self.event.is_empty()
    }

    /// Decode the embedded post. The platform sends it as a JSON document
    /// inside a string field.
    pub fn post(&self) -> Result<Post, EventError> {
        let raw = self
            .data
            .get("post")
            .ok_or(EventError::MissingField("post"))?
            .as_str()
            .ok_or(EventError::WrongType("post"))?;
        Ok(serde_json::from_str(raw)?)
    }

    pub fn channel_id(&self) -> Option<&str> {
        if !self.broadcast.channel_id.is_empty() {
            return Some(&self.broadcast.channel_id);
        }
        self.data.get("channel_id").and_then(Value::as_str)
    }

    /// Author of the event: the embedded post's author when there is one,
    /// otherwise a top-level `user_id`.
    pub fn author_id(&self) -> Option<String> {
        if let Ok(post) = self.post() {
            if !post.user_id.is_empty() {
                return Some(post.user_id);
            }
        }
        self.data
            .get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| (!self.broadcast.user_id.is_empty()).then(|| self.broadcast.user_id.clone()))
    }
}
