pub mod platform;
pub mod probes;
pub mod settings;
pub mod telemetry;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::signal;

use crate::platform::{ChatClient, mattermost::MattermostClient};
use crate::probes::{Probe, ShutdownSignal, broadcast::BroadcastProbe, shutdown_channel};
use crate::settings::Settings;
use crate::telemetry::TimingChannel;

pub struct ChatProbeEngine {
    pub settings: Settings,
}

impl ChatProbeEngine {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub async fn run(self) -> Result<()> {
        let (reports, report_rx) = telemetry::report_channel();
        telemetry::spawn_report_consumer(report_rx);

        let s = &self.settings;
        let speaker = MattermostClient::establish(
            &s.host,
            &s.ws_host,
            &s.team_id,
            &s.user_a,
            Some(reports.clone()),
        )
        .await
        .context("Could not establish user A")?;
        let listener = MattermostClient::establish(
            &s.host,
            &s.ws_host,
            &s.team_id,
            &s.user_b,
            Some(reports.clone()),
        )
        .await
        .context("Could not establish user B")?;

        let (shutdown_tx, shutdown) = shutdown_channel();
        let mut probes = build_probes(
            s,
            Arc::new(speaker),
            Arc::new(listener),
            Some(reports),
            shutdown,
        );
        if probes.is_empty() {
            warn!("No probes enabled; nothing to measure");
        }
        start_probes(&mut probes).await?;

        info!("Initial setup complete. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");
        let _ = shutdown_tx.send(true);

        Ok(())
    }
}

/// Build every probe enabled in `settings`.
pub fn build_probes(
    settings: &Settings,
    speaker: Arc<dyn ChatClient>,
    listener: Arc<dyn ChatClient>,
    reports: Option<TimingChannel>,
    shutdown: ShutdownSignal,
) -> Vec<Box<dyn Probe>> {
    let mut probes: Vec<Box<dyn Probe>> = Vec::new();

    if settings.broadcast_probe.enabled {
        let mut probe = BroadcastProbe::new(
            settings.broadcast_probe.clone(),
            speaker,
            listener,
            shutdown,
        );
        if let Some(reports) = reports {
            probe = probe.with_reporter(reports);
        }
        probes.push(Box::new(probe));
    }

    probes
}

/// Set up every probe, then start them. The first failure aborts the whole run.
pub async fn start_probes(probes: &mut [Box<dyn Probe>]) -> Result<()> {
    for probe in probes.iter_mut() {
        let name = probe.name();
        probe
            .setup()
            .await
            .with_context(|| format!("Could not setup probe {name}"))?;
    }

    for probe in probes.iter_mut() {
        let name = probe.name();
        probe
            .start()
            .with_context(|| format!("Could not start probe {name}"))?;
        telemetry::record_active_probe(name, 1);
    }

    Ok(())
}
