//! cachelist-sync: mirror cache-list membership across ZooKeeper ensembles.
//!
//! # Usage
//!
//! ```bash
//! cachelist-sync zk1.addr.com:17288/arcus/cache_list/cloud_1 \
//!                zk2.addr.com:17288/arcus/cache_list/cloud_1
//!
//! # Tunables
//! CACHELIST_SYNC_RETRY_DELAY_MS=500 RUST_LOG=cachelist_sync=debug cachelist-sync ...
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cachelist_sync::client::zookeeper::ZkClient;
use cachelist_sync::{EnsembleView, ReconciliationManager, SyncConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Ensembles to synchronize, as ADDR:PORT/arcus/cache_list/<cluster> (at least two)
    #[arg(required = true, value_name = "TARGET")]
    targets: Vec<String>,

    /// Delay between read retries while a node path is missing (overrides CACHELIST_SYNC_RETRY_DELAY_MS)
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Give up a read after this many attempts; 0 retries forever (overrides CACHELIST_SYNC_MAX_READ_ATTEMPTS)
    #[arg(long)]
    max_read_attempts: Option<u32>,

    /// Seconds between liveness log lines (overrides CACHELIST_SYNC_HEARTBEAT_SECS)
    #[arg(long)]
    heartbeat_secs: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<SyncConfig> {
        let mut config = SyncConfig::from_env()
            .context("Invalid CACHELIST_SYNC_* environment")?
            .with_targets(&self.targets)
            .context("Invalid target")?;

        if let Some(ms) = self.retry_delay_ms {
            config.read_retry.delay = Duration::from_millis(ms);
        }
        if let Some(cap) = self.max_read_attempts {
            config.read_retry.max_attempts = (cap > 0).then_some(cap);
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cachelist_sync=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.into_config()?;

    let mut manager = ReconciliationManager::new(&config);
    for target in &config.targets {
        let client = ZkClient::connect(&target.address)
            .await
            .with_context(|| format!("Failed to connect to {}", target.address))?;
        let mut view = EnsembleView::new(target.clone(), Arc::new(client), config.read_retry);
        view.refresh(None)
            .await
            .with_context(|| format!("Initial read of {target} failed"))?;
        manager.append(view);
    }

    info!(ensembles = config.targets.len(), "Sync manager start");
    let manager = manager.shared();
    let worker = tokio::spawn(manager.clone().run());

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                info!(passes = manager.pass_count(), "running...");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown().await;
    worker.await.context("Reconciliation loop panicked")?;
    Ok(())
}
