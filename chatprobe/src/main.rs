use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use chatprobe::{ChatProbeEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
#[command(version, about = "Measures message delivery latency on a Mattermost server")]
struct Opt {
    /// Path to the YAML config file
    #[arg(short, long, env = "CHATPROBE_CONFIG", default_value = "./config.yaml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    if let Err(e) = run(opt).await {
        application_exit(e);
    }
}

async fn run(opt: Opt) -> Result<()> {
    let settings = Settings::load(&opt.config).context("Config error")?;
    settings.validate().context("Config error")?;

    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;

    let result = ChatProbeEngine::new(settings).run().await;
    telemetry::shutdown_metrics();
    result
}

fn application_exit(err: anyhow::Error) -> ! {
    error!("Application error - {:#}", err);
    std::process::exit(1);
}
