//! OpenTelemetry metrics export module
//!
//! Probes and platform clients push [`TimingReport`]s onto a shared report
//! channel; [`spawn_report_consumer`] drains it into the `latency_seconds`
//! histogram, which is exported to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint Priority
//! 1. `otel_exporter_otlp_endpoint` from settings
//! 2. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 3. Neither set: metrics export disabled, recording helpers are no-ops

use anyhow::{Context, Result};
use log::{info, warn};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Capacity of the shared report channel. The consumer drains it continuously;
/// producers never wait on it.
pub const REPORT_CHANNEL_CAPACITY: usize = 1024;

pub const METRIC_PROBE_BROADCAST: &str = "probe_broadcast";
pub const METRIC_API_CREATE_POST: &str = "api_create_post";
pub const METRIC_API_CHANNEL_BY_NAME: &str = "api_channel_by_name";
pub const METRIC_API_JOIN_CHANNEL: &str = "api_join_channel";

/// One completed timing measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingReport {
    pub metric_name: &'static str,
    pub duration_seconds: f64,
}

pub type TimingChannel = mpsc::Sender<TimingReport>;

/// Global metrics handle
static METRICS: OnceLock<ChatProbeMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Global active probes count (for ObservableGauge callback)
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// chatprobe metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct ChatProbeMetrics {
    pub latency_seconds: Histogram<f64>,

    pub probe_send_errors: Counter<u64>,
    pub probe_correlation_misses: Counter<u64>,
    pub probe_malformed_events: Counter<u64>,

    pub dropped_timing_reports: Counter<u64>,
}

impl ChatProbeMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            latency_seconds: meter
                .f64_histogram("latency_seconds")
                .with_description("Probe round trips and platform API calls, by metric name")
                .with_unit("s")
                .build(),

            probe_send_errors: meter
                .u64_counter("probe_send_errors")
                .with_description("Probe messages the platform refused or never received")
                .with_unit("events")
                .build(),
            probe_correlation_misses: meter
                .u64_counter("probe_correlation_misses")
                .with_description("Delivered events whose token matched no in-flight send")
                .with_unit("events")
                .build(),
            probe_malformed_events: meter
                .u64_counter("probe_malformed_events")
                .with_description("Delivered events missing the expected post payload")
                .with_unit("events")
                .build(),

            dropped_timing_reports: meter
                .u64_counter("dropped_timing_reports")
                .with_description("Timing samples dropped because the report channel was full")
                .with_unit("events")
                .build(),
        }
    }
}

/// Priority:
/// 1. Explicit endpoint from settings
/// 2. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 3. If neither is set, metrics are disabled (no default fallback)
fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = match configured {
        Some(ep) if !ep.is_empty() => ep.to_string(),
        _ => std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?,
    };
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if no endpoint is configured.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("No OTLP endpoint configured. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "chatprobe"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("chatprobe");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(ChatProbeMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static ChatProbeMetrics> {
    METRICS.get()
}

pub fn report_channel() -> (TimingChannel, mpsc::Receiver<TimingReport>) {
    mpsc::channel(REPORT_CHANNEL_CAPACITY)
}

/// Hand a sample to the report channel without waiting.
///
/// A full or closed channel drops the sample; the caller is never blocked
/// by a slow consumer.
pub fn try_report(reports: &TimingChannel, report: TimingReport) -> bool {
    match reports.try_send(report) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(report)) => {
            warn!(
                "Report channel full, dropping {} sample ({:.3}s)",
                report.metric_name, report.duration_seconds
            );
            record_dropped_report(report.metric_name);
            false
        }
        Err(mpsc::error::TrySendError::Closed(report)) => {
            warn!("Report channel closed, dropping {} sample", report.metric_name);
            record_dropped_report(report.metric_name);
            false
        }
    }
}

/// Drain timing reports into the latency histogram until every sender is gone.
pub fn spawn_report_consumer(mut rx: mpsc::Receiver<TimingReport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            log::debug!("{} took {:.3}s", report.metric_name, report.duration_seconds);
            record_timing(&report);
        }
        info!("Report channel closed; timing consumer exiting");
    })
}

pub fn record_timing(report: &TimingReport) {
    if let Some(m) = metrics() {
        let attrs = [KeyValue::new("metric", report.metric_name)];
        m.latency_seconds.record(report.duration_seconds, &attrs);
    }
}

// === Probe outcome helpers ===

pub fn record_send_error(probe: &'static str) {
    if let Some(m) = metrics() {
        m.probe_send_errors.add(1, &[KeyValue::new("probe", probe)]);
    }
}

pub fn record_correlation_miss(probe: &'static str) {
    if let Some(m) = metrics() {
        m.probe_correlation_misses.add(1, &[KeyValue::new("probe", probe)]);
    }
}

pub fn record_malformed_event(probe: &'static str) {
    if let Some(m) = metrics() {
        m.probe_malformed_events.add(1, &[KeyValue::new("probe", probe)]);
    }
}

fn record_dropped_report(metric_name: &'static str) {
    if let Some(m) = metrics() {
        m.dropped_timing_reports
            .add(1, &[KeyValue::new("metric", metric_name)]);
    }
}

/// Record active probe count
/// Updates the global active probes map for ObservableGauge callback
pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        // Returns None if environment variable is not set
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(get_otlp_endpoint(None).is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "") };
        assert!(get_otlp_endpoint(None).is_none());
        assert!(get_otlp_endpoint(Some("")).is_none());
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_from_env() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "http://custom:4317") };

        let endpoint = get_otlp_endpoint(None);
        assert_eq!(endpoint, Some("http://custom:4317".to_string()));
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_settings_endpoint_wins_over_env() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "http://from-env:4317") };

        let endpoint = get_otlp_endpoint(Some("collector:4317"));
        assert_eq!(endpoint, Some("http://collector:4317".to_string()));
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    fn test_try_report_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let report = TimingReport {
            metric_name: METRIC_PROBE_BROADCAST,
            duration_seconds: 0.1,
        };

        assert!(try_report(&tx, report.clone()));
        assert!(!try_report(&tx, report.clone()));
        assert_eq!(rx.try_recv().unwrap(), report);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_try_report_closed_channel() {
        let (tx, rx) = report_channel();
        drop(rx);
        assert!(!try_report(
            &tx,
            TimingReport {
                metric_name: METRIC_API_CREATE_POST,
                duration_seconds: 0.02,
            }
        ));
    }

    #[tokio::test]
    async fn test_report_consumer_exits_when_senders_drop() {
        let (tx, rx) = report_channel();
        let consumer = spawn_report_consumer(rx);

        for i in 0..5 {
            tx.send(TimingReport {
                metric_name: METRIC_PROBE_BROADCAST,
                duration_seconds: i as f64 * 0.1,
            })
            .await
            .unwrap();
        }
        drop(tx);

        consumer.await.expect("consumer task panicked");
    }
}
