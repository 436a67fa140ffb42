//! Chat platform access used by probes.

use async_trait::async_trait;
use chatprobe_common::{Channel, Post};

pub mod mattermost;
pub mod subscription;

pub use subscription::{Subscription, SubscriptionRouter};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {path} returned HTTP {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
    #[error("login response carried no session token")]
    MissingToken,
}

/// One authenticated identity on the chat platform.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn user_id(&self) -> &str;

    async fn create_post(&self, post: &Post) -> Result<(), ClientError>;

    async fn channel_by_name(&self, name: &str) -> Result<Channel, ClientError>;

    /// Add this identity to a channel. Joining a channel twice is not an error.
    async fn join_channel(&self, channel_id: &str) -> Result<(), ClientError>;

    /// Route future events matching `subscription` to its destination.
    fn add_subscription(&self, subscription: Subscription);
}
