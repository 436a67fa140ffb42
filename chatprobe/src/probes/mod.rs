use async_trait::async_trait;
use tokio::sync::watch;

use crate::platform::ClientError;

pub mod broadcast;
pub mod correlation;

/// Receiving end of the stop signal shared by every probe loop.
pub type ShutdownSignal = watch::Receiver<bool>;

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    watch::channel(false)
}

/// Resolves once shutdown has been requested.
///
/// If the sending side is dropped without ever requesting shutdown, this
/// never resolves.
pub async fn wait_for_shutdown(signal: &mut ShutdownSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Constructed,
    SetupComplete,
    Active,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("either channel_id or channel_name must be set")]
    MissingChannel,
    #[error("could not resolve channel '{name}'")]
    ChannelLookup {
        name: String,
        #[source]
        source: ClientError,
    },
    #[error("user {user_id} could not join channel {channel_id}")]
    Membership {
        user_id: String,
        channel_id: String,
        #[source]
        source: ClientError,
    },
    #[error("probe started before setup completed")]
    NotSetUp,
}

/// A latency probe driven by the engine: `setup` once, then `start`.
#[async_trait]
pub trait Probe: Send {
    fn name(&self) -> &'static str;

    /// One-time preparation against the platform. Any error is fatal.
    async fn setup(&mut self) -> Result<(), ProbeError>;

    /// Launch the probe's background loops. Calling it again once active is a no-op.
    fn start(&mut self) -> Result<(), ProbeError>;

    fn state(&self) -> ProbeState;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_shutdown_resolves_on_request() {
        let (tx, mut rx) = shutdown_channel();
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown was not observed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_already_requested() {
        let (tx, mut rx) = shutdown_channel();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), wait_for_shutdown(&mut rx))
            .await
            .expect("shutdown was not observed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_never_signals() {
        let (tx, mut rx) = shutdown_channel();
        drop(tx);
        let result =
            tokio::time::timeout(Duration::from_secs(60), wait_for_shutdown(&mut rx)).await;
        assert!(result.is_err());
    }
}
