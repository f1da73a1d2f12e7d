//! RelayMQ - clustered MQTT v3.1.1 broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: relaymq.toml)
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-qos <N>          Maximum QoS (0, 1 or 2)
//!   --node-id <ID>         Cluster node identifier
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaymq::broker::Broker;
use relaymq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// RelayMQ - clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(author = "RelayMQ Contributors")]
#[command(version)]
#[command(about = "Clustered MQTT v3.1.1 broker with QoS-aware publish routing")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "relaymq.toml")]
    config: PathBuf,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Cluster node identifier
    #[arg(long)]
    node_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI level, then RUST_LOG, then the config file
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.as_directive()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .init();

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(max_qos) = args.max_qos {
        config.mqtt.max_qos = max_qos;
    }
    if let Some(node_id) = args.node_id {
        config.cluster.node_id = Some(node_id);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting RelayMQ MQTT Broker");
    info!("  Bind address: {}", config.server.bind);
    info!("  Max connections: {}", config.limits.max_connections);
    info!("  Max packet size: {} bytes", config.limits.max_packet_size);
    info!("  Max QoS: {}", config.mqtt.max_qos);
    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.cluster.enabled {
        info!(
            "  Cluster: enabled (node={}, peers={})",
            config.cluster.get_node_id(),
            config.cluster.peers.join(", ")
        );
    } else {
        info!("  Cluster: disabled");
    }
    if config.persistence.enabled {
        info!("  Persistence: {}", config.persistence.path.display());
    } else {
        info!("  Persistence: disabled");
    }

    let broker = Arc::new(Broker::new(config).await?);

    let runner = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.run().await })
    };

    tokio::select! {
        result = runner => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Broker stopped: {}", e),
                Err(e) => error!("Broker task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    broker.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
