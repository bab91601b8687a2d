use std::fs::OpenOptions;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::app_config::AppConfig;

/// Install the coordinator's tracing stack: a compact stdout layer, a tokio
/// console layer for poking at the event loop, and an append-mode file layer
/// when the config names a log file. Speaker events and gain schedules log
/// at debug; the file layer stays ANSI-free.
pub fn setup_tracing_subscriber(config: &AppConfig) -> anyhow::Result<()> {
    let level = LevelFilter::from_level(config.get_log_level());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_filter(level);

    let console_layer = console_subscriber::ConsoleLayer::builder()
        .with_default_env()
        .spawn();

    let file_layer = config
        .log_file
        .as_ref()
        .map(|path| {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {path:?}"))?;
            Ok::<_, anyhow::Error>(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(file)
                    .with_filter(level),
            )
        })
        .transpose()?;

    let registry = tracing_subscriber::registry()
        .with(console_layer)
        .with(stdout_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(registry)
        .context("a tracing subscriber is already installed")?;

    tracing::debug!(level = %config.get_log_level(), "tracing subscriber installed");
    Ok(())
}
