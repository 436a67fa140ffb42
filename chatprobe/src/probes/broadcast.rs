//! Broadcast round-trip probe.
//!
//! The speaker posts a unique token into a channel on a fixed interval; the
//! listener receives the resulting `posted` event over its websocket. The
//! time between recording the token and seeing it come back is the
//! delivery latency.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chatprobe_common::{EVENT_POSTED, Post, WebSocketEvent};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::{
    Probe, ProbeError, ProbeState, ShutdownSignal, correlation::MessageMap, wait_for_shutdown,
};
use crate::platform::{ChatClient, ClientError, Subscription};
use crate::settings::BroadcastProbeSettings;
use crate::telemetry::{self, TimingChannel, TimingReport};

pub const PROBE_NAME: &str = "broadcast";

const EVENT_CHANNEL_CAPACITY: usize = 10;

pub struct BroadcastProbe {
    speaker: Arc<dyn ChatClient>,
    listener: Arc<dyn ChatClient>,
    settings: BroadcastProbeSettings,
    messages: Arc<MessageMap>,
    events_tx: mpsc::Sender<WebSocketEvent>,
    events_rx: Option<mpsc::Receiver<WebSocketEvent>>,
    reports: Option<TimingChannel>,
    shutdown: ShutdownSignal,
    channel_id: Option<String>,
    state: ProbeState,
}

impl BroadcastProbe {
    pub fn new(
        settings: BroadcastProbeSettings,
        speaker: Arc<dyn ChatClient>,
        listener: Arc<dyn ChatClient>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            speaker,
            listener,
            settings,
            messages: Arc::new(MessageMap::new()),
            events_tx,
            events_rx: Some(events_rx),
            reports: None,
            shutdown,
            channel_id: None,
            state: ProbeState::Constructed,
        }
    }

    /// Emit a timing sample to `reports` for every completed round trip.
    pub fn with_reporter(mut self, reports: TimingChannel) -> Self {
        self.reports = Some(reports);
        self
    }

    #[cfg(test)]
    pub(crate) fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// Events authored by the speaker, posted in the probe channel.
    pub fn subscription(&self, channel_id: &str) -> Subscription {
        let mut sub = Subscription::new(self.events_tx.clone());
        sub.user_ids.push(self.speaker.user_id().to_string());
        sub.channel_ids.push(channel_id.to_string());
        sub.event_types.push(EVENT_POSTED.to_string());
        sub
    }

    async fn resolve_channel(speaker: &dyn ChatClient, name: &str) -> Result<String, ProbeError> {
        let channel = speaker
            .channel_by_name(name)
            .await
            .map_err(|source| ProbeError::ChannelLookup {
                name: name.to_string(),
                source,
            })?;
        info!("Resolved channel '{}' to {}", name, channel.id);
        Ok(channel.id)
    }

    async fn ensure_membership(
        client: &dyn ChatClient,
        channel_id: &str,
    ) -> Result<(), ProbeError> {
        client
            .join_channel(channel_id)
            .await
            .map_err(|source| ProbeError::Membership {
                user_id: client.user_id().to_string(),
                channel_id: channel_id.to_string(),
                source,
            })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[async_trait]
impl Probe for BroadcastProbe {
    fn name(&self) -> &'static str {
        PROBE_NAME
    }

    /// Intended to run exactly once; a second call registers a second subscription.
    async fn setup(&mut self) -> Result<(), ProbeError> {
        let channel_id = match (
            non_empty(&self.settings.channel_id),
            non_empty(&self.settings.channel_name).map(str::to_string),
        ) {
            (Some(id), _) => id.to_string(),
            (None, Some(name)) => Self::resolve_channel(self.speaker.as_ref(), &name).await?,
            (None, None) => return Err(ProbeError::MissingChannel),
        };

        Self::ensure_membership(self.listener.as_ref(), &channel_id).await?;
        Self::ensure_membership(self.speaker.as_ref(), &channel_id).await?;

        self.listener.add_subscription(self.subscription(&channel_id));

        info!("Broadcast probe ready on channel {}", channel_id);
        self.channel_id = Some(channel_id);
        self.state = ProbeState::SetupComplete;
        Ok(())
    }

    fn start(&mut self) -> Result<(), ProbeError> {
        match self.state {
            ProbeState::Active => return Ok(()),
            ProbeState::Constructed => return Err(ProbeError::NotSetUp),
            ProbeState::SetupComplete => {}
        }
        let channel_id = self.channel_id.clone().ok_or(ProbeError::NotSetUp)?;
        let events = self.events_rx.take().ok_or(ProbeError::NotSetUp)?;

        let correlator = Correlator::new(self.messages.clone(), self.reports.clone());
        tokio::spawn(correlator.run(events, self.shutdown.clone()));

        let broadcaster = Broadcaster {
            speaker: self.speaker.clone(),
            channel_id: channel_id.into(),
            messages: self.messages.clone(),
        };
        tokio::spawn(run_scheduler(
            broadcaster,
            self.settings.frequency(),
            self.shutdown.clone(),
        ));

        self.state = ProbeState::Active;
        info!(
            "Broadcast probe started, sending every {:?}",
            self.settings.frequency()
        );
        Ok(())
    }

    fn state(&self) -> ProbeState {
        self.state
    }
}

/// Posts probe messages as the speaker.
#[derive(Clone)]
pub struct Broadcaster {
    speaker: Arc<dyn ChatClient>,
    channel_id: Arc<str>,
    messages: Arc<MessageMap>,
}

impl Broadcaster {
    /// Send one tagged post and return its token.
    ///
    /// The token is recorded before the post is submitted, so the listener can
    /// never observe an event whose token is not yet known. A failed
    /// submission leaves its entry in place.
    pub async fn send_write(&self) -> Result<String, ClientError> {
        let token = Uuid::new_v4().to_string();
        self.messages.add(token.clone(), Instant::now());

        let post = Post {
            channel_id: self.channel_id.to_string(),
            user_id: self.speaker.user_id().to_string(),
            message: token.clone(),
            ..Default::default()
        };

        if let Err(e) = self.speaker.create_post(&post).await {
            error!("Error while sending broadcast post: {}", e);
            telemetry::record_send_error(PROBE_NAME);
            return Err(e);
        }
        debug!("Sent broadcast token {}", token);
        Ok(token)
    }
}

/// Fire one independent send per tick. Sends are never awaited here, so a
/// slow submission cannot delay the next tick.
async fn run_scheduler(
    broadcaster: Broadcaster,
    frequency: Duration,
    mut shutdown: ShutdownSignal,
) {
    let first_tick = match Instant::now().checked_add(frequency) {
        Some(at) if !frequency.is_zero() => at,
        _ => {
            error!("Broadcast scheduler not started: invalid frequency {:?}", frequency);
            return;
        }
    };
    let mut ticker = time::interval_at(first_tick, frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Broadcast scheduler stopping");
                return;
            }
            _ = ticker.tick() => {
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move {
                    let _ = broadcaster.send_write().await;
                });
            }
        }
    }
}

/// Matches delivered events back to their sends.
pub struct Correlator {
    messages: Arc<MessageMap>,
    reports: Option<TimingChannel>,
}

impl Correlator {
    pub fn new(messages: Arc<MessageMap>, reports: Option<TimingChannel>) -> Self {
        Self { messages, reports }
    }

    /// Drain `events` one at a time, in delivery order, until shutdown.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<WebSocketEvent>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Broadcast listener stopping");
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(&event);
                    }
                    None => {
                        warn!("Broadcast event channel closed");
                        return;
                    }
                },
            }
        }
    }

    /// Correlate one event, returning the measured round trip when its token
    /// matched an in-flight send.
    pub fn handle_event(&self, event: &WebSocketEvent) -> Option<Duration> {
        let received = Instant::now();

        let post = match event.post() {
            Ok(post) => post,
            Err(e) => {
                warn!(
                    "Skipping malformed {} event (seq {}): {}",
                    event.event, event.seq, e
                );
                telemetry::record_malformed_event(PROBE_NAME);
                return None;
            }
        };

        let Some(sent) = self.messages.take(&post.message) else {
            warn!("Failed to find message by token {:?}", post.message);
            telemetry::record_correlation_miss(PROBE_NAME);
            return None;
        };

        let elapsed = received.saturating_duration_since(sent);
        if let Some(reports) = &self.reports {
            telemetry::try_report(
                reports,
                TimingReport {
                    metric_name: telemetry::METRIC_PROBE_BROADCAST,
                    duration_seconds: elapsed.as_secs_f64(),
                },
            );
        }
        Some(elapsed)
    }
}
