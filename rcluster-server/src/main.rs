//! Proxy startup: parse arguments, install logging, serve until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rcluster_server::{Listener, ProxyConfig};
use rcluster_shard::Cluster;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::parse();
    let filter = EnvFilter::try_new(&config.log)
        .with_context(|| format!("invalid log filter {:?}", config.log))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cluster = Arc::new(Cluster::new(usize::from(config.replicaness)));
    let listener = Listener::bind(&config, Arc::clone(&cluster))
        .await
        .context("failed to bind the client listener")?;

    tokio::select! {
        result = listener.run() => result.context("client listener failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
