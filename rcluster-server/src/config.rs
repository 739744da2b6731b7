//! Launcher configuration.

use clap::Parser;

/// Command-line arguments of the proxy binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "rcluster", about = "Replicating Redis sharding proxy", version)]
pub struct ProxyConfig {
    /// Port to listen on for client connections.
    #[arg(long, default_value_t = 6381)]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Password clients must present via AUTH before any other command.
    #[arg(long)]
    pub password: Option<String>,

    /// Desired number of replicas per write; also settable at runtime via
    /// SETREPLICANESS.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub replicaness: u16,

    /// Tracing filter, e.g. "info" or "rcluster_shard=debug".
    #[arg(long, default_value = "info")]
    pub log: String,
}
