//! In-process stand-ins for the chat platform, used by unit tests.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chatprobe_common::{Channel, EVENT_POSTED, Post, WebSocketEvent};
use serde_json::json;

use crate::platform::{ChatClient, ClientError, Subscription, SubscriptionRouter};

type PostHook = Box<dyn Fn(&Post) + Send + Sync>;

#[derive(Default)]
pub(crate) struct FakeClient {
    pub user_id: String,
    /// channel name -> channel id
    pub channels: HashMap<String, String>,
    fail_posts: bool,
    fail_join: bool,
    pub posts: Mutex<Vec<Post>>,
    pub joined: Mutex<Vec<String>>,
    pub router: SubscriptionRouter,
    on_post: Option<PostHook>,
}

impl FakeClient {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_channel(mut self, name: &str, id: &str) -> Self {
        self.channels.insert(name.to_string(), id.to_string());
        self
    }

    pub fn failing_posts(mut self) -> Self {
        self.fail_posts = true;
        self
    }

    pub fn failing_joins(mut self) -> Self {
        self.fail_join = true;
        self
    }

    /// Run `hook` for every submitted post, after the submission is accepted.
    pub fn on_post(mut self, hook: impl Fn(&Post) + Send + Sync + 'static) -> Self {
        self.on_post = Some(Box::new(hook));
        self
    }

    pub fn posts(&self) -> Vec<Post> {
        self.posts.lock().unwrap().clone()
    }

    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().unwrap().clone()
    }
}

fn server_error(method: &'static str, path: String) -> ClientError {
    ClientError::Status {
        method,
        path,
        status: 500,
        body: r#"{"message":"internal error"}"#.to_string(),
    }
}

#[async_trait]
impl ChatClient for FakeClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn create_post(&self, post: &Post) -> Result<(), ClientError> {
        self.posts.lock().unwrap().push(post.clone());
        if self.fail_posts {
            return Err(server_error("POST", "/posts".to_string()));
        }
        if let Some(hook) = &self.on_post {
            hook(post);
        }
        Ok(())
    }

    async fn channel_by_name(&self, name: &str) -> Result<Channel, ClientError> {
        match self.channels.get(name) {
            Some(id) => Ok(Channel {
                id: id.clone(),
                name: name.to_string(),
                ..Default::default()
            }),
            None => Err(ClientError::Status {
                method: "GET",
                path: format!("/teams/team1/channels/name/{name}"),
                status: 404,
                body: String::new(),
            }),
        }
    }

    async fn join_channel(&self, channel_id: &str) -> Result<(), ClientError> {
        if self.fail_join {
            return Err(server_error("POST", format!("/channels/{channel_id}/members")));
        }
        self.joined.lock().unwrap().push(channel_id.to_string());
        Ok(())
    }

    fn add_subscription(&self, subscription: Subscription) {
        self.router.add(subscription);
    }
}

/// A `posted` event as the platform would deliver it.
pub(crate) fn posted_event(channel_id: &str, user_id: &str, message: &str) -> WebSocketEvent {
    let post = json!({ "channel_id": channel_id, "user_id": user_id, "message": message });
    serde_json::from_value(json!({
        "event": EVENT_POSTED,
        "data": { "post": post.to_string() },
        "broadcast": { "channel_id": channel_id },
    }))
    .unwrap()
}
