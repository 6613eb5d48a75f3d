mod commands;
mod config;
mod devices;
mod mqtt;
mod router;
mod rules;
mod sensor;
mod tsdb;

use crate::commands::HttpCommandTransport;
use crate::config::Config;
use crate::devices::DeviceConfigCache;
use crate::router::Router;
use crate::rules::{RuleEngine, RuleStore};
use crate::tsdb::{InfluxClient, TsdbWriter};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,automation_sidecar=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    // Fatal if the TSDB is unreachable at startup: a supervisor restart beats
    // ingesting into a black hole.
    let influx = InfluxClient::new(&config)?;
    influx.health().await.context("initial TSDB handshake")?;
    tracing::info!(url = %config.tsdb_url, bucket = %config.tsdb_bucket, "TSDB reachable");

    let store = Arc::new(RuleStore::load(&config.rules_path));
    let cache = DeviceConfigCache::new();

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(HttpCommandTransport::new(&config)?);
    let dispatcher = commands::spawn_dispatcher(
        transport,
        cache.clone(),
        cmd_rx,
        cancel.clone(),
        tracker.clone(),
    );

    let (point_tx, point_rx) = mpsc::channel(config.tsdb_max_queue);
    let writer = TsdbWriter::new(point_tx);
    let writer_handle = tsdb::spawn_writer(
        influx,
        point_rx,
        config.tsdb_batch_size,
        config.flush_interval(),
    );

    let engine = RuleEngine::new(store.clone(), cmd_tx);
    let (mqtt_client, eventloop) = mqtt::connect(&config);
    let router = Router::new(
        store.clone(),
        cache,
        engine,
        writer.clone(),
        mqtt_client.clone(),
    );

    let listener_config = config.clone();
    let listener_cancel = cancel.clone();
    let listener = tokio::spawn(async move {
        mqtt::run_listener(listener_config, mqtt_client, eventloop, router, listener_cancel).await
    });

    let outcome = tokio::select! {
        res = listener => match res {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("broker listener panicked: {err}")),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    // Stop accepting new pulses; in-flight ones are cancelled without their
    // off-command, and anything mid-POST gets the grace period to finish.
    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(config.shutdown_grace(), tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("in-flight commands did not drain within the grace period");
    }

    writer.flush().await;
    writer_handle.abort();
    dispatcher.abort();

    if let Err(err) = store.save() {
        tracing::warn!(error = %err, "failed to flush rule snapshot on shutdown");
    }

    outcome
}
