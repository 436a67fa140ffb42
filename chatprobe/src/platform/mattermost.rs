//! Mattermost API v4 client: REST for actions, websocket for the event stream.

use std::sync::Arc;

use async_trait::async_trait;
use chatprobe_common::{Channel, Post, User, WebSocketEvent};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde_json::json;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use super::{ChatClient, ClientError, Subscription, SubscriptionRouter};
use crate::settings::Credentials;
use crate::telemetry::{self, TimingChannel, TimingReport};

const API_PREFIX: &str = "/api/v4";
const TOKEN_HEADER: &str = "Token";

pub struct MattermostClient {
    http: reqwest::Client,
    api_url: String,
    team_id: String,
    token: String,
    user: User,
    router: Arc<SubscriptionRouter>,
    reports: Option<TimingChannel>,
}

impl MattermostClient {
    /// Log in, then open the event websocket for this identity.
    pub async fn establish(
        host: &str,
        ws_host: &str,
        team_id: &str,
        credentials: &Credentials,
        reports: Option<TimingChannel>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::new();
        let api_url = api_url(host);

        let resp = http
            .post(format!("{api_url}/users/login"))
            .json(&json!({
                "login_id": credentials.login_id,
                "password": credentials.password,
            }))
            .send()
            .await?;
        let resp = check_status(resp, "POST", "/users/login").await?;
        let token = resp
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(ClientError::MissingToken)?;
        let user: User = resp.json().await?;
        info!("Logged in as {} ({})", user.username, user.id);

        let client = Self {
            http,
            api_url,
            team_id: team_id.to_string(),
            token,
            user,
            router: Arc::new(SubscriptionRouter::new()),
            reports,
        };
        client.connect_events(ws_host).await?;
        Ok(client)
    }

    async fn connect_events(&self, ws_host: &str) -> Result<(), ClientError> {
        let url = websocket_url(ws_host);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let challenge = json!({
            "seq": 1,
            "action": "authentication_challenge",
            "data": { "token": self.token },
        });
        write.send(Message::Text(challenge.to_string().into())).await?;
        info!("Event stream connected for {}", self.user.username);

        let router = self.router.clone();
        let username = self.user.username.clone();
        tokio::spawn(async move {
            // Keep the write half alive so the server does not see a half-closed socket.
            let _write = write;
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!("Event stream error for {}: {}", username, e);
                        break;
                    }
                };
                let text = match &msg {
                    Message::Text(t) => t.as_str(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                match serde_json::from_str::<WebSocketEvent>(text) {
                    Ok(event) if event.is_reply() => debug!("Websocket reply: {}", text),
                    Ok(event) => {
                        router.dispatch(&event);
                    }
                    Err(e) => warn!("Undecodable websocket frame: {}", e),
                }
            }
            error!("Event stream closed for {}", username);
        });
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
    }

    fn report(&self, metric_name: &'static str, started: Instant) {
        if let Some(reports) = &self.reports {
            telemetry::try_report(
                reports,
                TimingReport {
                    metric_name,
                    duration_seconds: started.elapsed().as_secs_f64(),
                },
            );
        }
    }
}

#[async_trait]
impl ChatClient for MattermostClient {
    fn user_id(&self) -> &str {
        &self.user.id
    }

    async fn create_post(&self, post: &Post) -> Result<(), ClientError> {
        let started = Instant::now();
        let resp = self.request(Method::POST, "/posts").json(post).send().await?;
        check_status(resp, "POST", "/posts").await?;
        self.report(telemetry::METRIC_API_CREATE_POST, started);
        Ok(())
    }

    async fn channel_by_name(&self, name: &str) -> Result<Channel, ClientError> {
        let url = segment_url(
            &self.api_url,
            &["teams", self.team_id.as_str(), "channels", "name", name],
        )?;
        let started = Instant::now();
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;
        let channel = check_status(resp, "GET", url.path()).await?.json().await?;
        self.report(telemetry::METRIC_API_CHANNEL_BY_NAME, started);
        Ok(channel)
    }

    async fn join_channel(&self, channel_id: &str) -> Result<(), ClientError> {
        let path = format!("/channels/{}/members", channel_id);
        let started = Instant::now();
        let resp = self
            .request(Method::POST, &path)
            .json(&json!({ "user_id": self.user.id }))
            .send()
            .await?;
        check_status(resp, "POST", &path).await?;
        self.report(telemetry::METRIC_API_JOIN_CHANNEL, started);
        Ok(())
    }

    fn add_subscription(&self, subscription: Subscription) {
        self.router.add(subscription);
    }
}

async fn check_status(
    resp: Response,
    method: &'static str,
    path: &str,
) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status {
        method,
        path: path.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Append `segments` to `base`, percent-encoding each so user-supplied names
/// cannot alter the path.
fn segment_url(base: &str, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url =
        Url::parse(base).map_err(|e| ClientError::InvalidUrl(format!("{base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| ClientError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn api_url(host: &str) -> String {
    format!("{}{}", host.trim_end_matches('/'), API_PREFIX)
}

/// Accepts a bare host or an http(s)/ws(s) URL and yields the v4 websocket endpoint.
fn websocket_url(ws_host: &str) -> String {
    let base = ws_host.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("wss://{base}")
    };
    format!("{base}{API_PREFIX}/websocket")
}
