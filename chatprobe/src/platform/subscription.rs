use std::sync::RwLock;

use chatprobe_common::WebSocketEvent;
use log::warn;
use tokio::sync::mpsc;

/// Declares which platform events a probe wants delivered to its inbound channel.
///
/// An empty set places no constraint on that attribute.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub user_ids: Vec<String>,
    pub channel_ids: Vec<String>,
    pub event_types: Vec<String>,
    sender: mpsc::Sender<WebSocketEvent>,
}

impl Subscription {
    pub fn new(sender: mpsc::Sender<WebSocketEvent>) -> Self {
        Self {
            user_ids: Vec::new(),
            channel_ids: Vec::new(),
            event_types: Vec::new(),
            sender,
        }
    }

    pub fn matches(&self, event: &WebSocketEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| *t == event.event) {
            return false;
        }

        if !self.channel_ids.is_empty() {
            let Some(channel) = event.channel_id() else {
                return false;
            };
            if !self.channel_ids.iter().any(|c| c == channel) {
                return false;
            }
        }

        if !self.user_ids.is_empty() {
            let Some(author) = event.author_id() else {
                return false;
            };
            if !self.user_ids.contains(&author) {
                return false;
            }
        }

        true
    }
}

/// Demultiplexes one client's event stream onto the subscribed probe channels.
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription: Subscription) {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subs.push(subscription);
    }

    /// Forward `event` to every matching subscriber, returning how many accepted it.
    ///
    /// A destination that is full or closed loses the event; the reader that
    /// feeds the router must never stall on a single slow probe.
    pub fn dispatch(&self, event: &WebSocketEvent) -> usize {
        let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.matches(event)) {
            match sub.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber channel full, dropping {} event (seq {})",
                        event.event, event.seq
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(
                        "Subscriber channel closed, dropping {} event (seq {})",
                        event.event, event.seq
                    );
                }
            }
        }
        delivered
    }
}
