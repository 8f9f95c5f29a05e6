mod config;
mod data;
mod execution;
mod monitoring;
mod pipeline;

use anyhow::Result;
use config::{Config, EnvConfig};
use data::cache::DedupStore;
use data::stream::HttpTipSource;
use execution::forwarder::HttpForwarder;
use monitoring::logger::CsvLogger;
use pipeline::backoff::Backoff;
use pipeline::driver::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("tip-relay starting...");

    // Load configuration
    let config = Config::load_or_default("config.toml")?;
    let env_config = EnvConfig::load("credentials.json")?;

    let source = HttpTipSource::new(&env_config, &config.stream)?;
    let sink = HttpForwarder::new(&config.sink, env_config.sink_url.clone())?;
    tracing::info!("Streaming from {}", source.url());
    tracing::info!("Forwarding to {}", sink.url());

    let store = match config.dedup.window() {
        Some(window) => {
            tracing::info!("Dedup window: {:?}", window);
            DedupStore::with_window(window)
        }
        None => DedupStore::new(),
    };

    let mut pipeline = Pipeline::new(source, sink, store, Backoff::from_config(&config.reconnect))
        .with_purge_every(config.dedup.purge_every)
        .with_echo(true);

    if config.monitoring.csv_logging {
        tracing::info!("CSV logging to {}", config.monitoring.csv_log_path);
        pipeline = pipeline.with_audit_log(CsvLogger::new(config.monitoring.csv_log_path.clone())?);
    }

    tokio::select! {
        _ = pipeline.run() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Shutting down...");
        }
    }

    tracing::info!("Final stats: {:?}", pipeline.stats());

    Ok(())
}
