use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

const DEFAULT_FREQUENCY_MS: u64 = 1000;
const MAX_FREQUENCY_MS: u64 = 24 * 60 * 60 * 1000;
const ENV_PREFIX: &str = "CHATPROBE";

/// Login for one of the two probe identities.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Credentials {
    #[serde(default)]
    pub login_id: String,
    #[serde(default)]
    pub password: String,
}

/// Broadcast round-trip probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BroadcastProbeSettings {
    #[serde(default)]
    pub enabled: bool,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub frequency_ms: Option<u64>,
}

impl BroadcastProbeSettings {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms.unwrap_or(DEFAULT_FREQUENCY_MS))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ws_host: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_a: Credentials,
    #[serde(default)]
    pub user_b: Credentials,
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub broadcast_probe: BroadcastProbeSettings,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("`{0}` must be set")]
    Missing(&'static str),
    #[error("broadcast_probe.frequency_ms must be greater than zero")]
    ZeroFrequency,
    #[error("broadcast_probe.frequency_ms must not exceed one day")]
    FrequencyTooLarge,
}

impl Settings {
    /// Load settings from an optional YAML file, overridden by the environment.
    ///
    /// Variables are prefixed with `CHATPROBE_` and nested keys use `__`,
    /// e.g. `CHATPROBE_BROADCAST_PROBE__FREQUENCY_MS`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_sources(File::from(path).format(FileFormat::Yaml).required(false))
    }

    fn from_sources(file: impl config::Source + Send + Sync + 'static) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings.redacted());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.is_empty() {
            return Err(SettingsError::Missing("host"));
        }
        if self.ws_host.is_empty() {
            return Err(SettingsError::Missing("ws_host"));
        }
        if self.team_id.is_empty() {
            return Err(SettingsError::Missing("team_id"));
        }
        for (name, creds) in [("user_a", &self.user_a), ("user_b", &self.user_b)] {
            if creds.login_id.is_empty() || creds.password.is_empty() {
                return Err(SettingsError::Missing(name));
            }
        }
        if self.broadcast_probe.enabled {
            match self.broadcast_probe.frequency_ms {
                Some(0) => return Err(SettingsError::ZeroFrequency),
                Some(ms) if ms > MAX_FREQUENCY_MS => {
                    return Err(SettingsError::FrequencyTooLarge);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.user_a.password = "***".to_string();
        copy.user_b.password = "***".to_string();
        copy
    }
}
