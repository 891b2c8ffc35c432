use anyhow::Result;
use clap::Parser;
use tracing::error;

use fedprobe_core::cli::{App, Cli};
use fedprobe_core::config::AppConfig;
use fedprobe_core::{metrics, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    cli.apply_overrides(&mut config);
    telemetry::init_tracing(&config.log_filter);

    let metrics_dump = config.metrics_dump;
    let app = App::new(config)?;
    let result = app.run(cli.command, cli.json).await;

    if metrics_dump {
        eprintln!("{}", String::from_utf8_lossy(&metrics::gather()));
    }
    if let Err(err) = &result {
        error!(target = "fedprobe::main", error = %err, "command failed");
    }
    result
}
