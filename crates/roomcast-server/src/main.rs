//! # Roomcast Server
//!
//! Room-messaging gateway. Run several instances against one broker to
//! scale horizontally.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (Redis on 127.0.0.1:6379)
//! roomcast
//!
//! # Run with custom config
//! roomcast --config /path/to/roomcast.toml
//!
//! # Run with environment variables
//! ROOMCAST_PORT=8080 ROOMCAST_BROKER__URL=redis://redis:6379 roomcast
//!
//! # Config file from the environment
//! ROOMCAST_CONFIG_FILE=/path/to/roomcast.toml roomcast
//!
//! # Single node, no broker
//! ROOMCAST_BROKER__URL=memory:// roomcast
//! ```

use anyhow::Result;
use clap::Parser;
use roomcast_server::{config::Config, metrics, run_server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about = "Horizontally scalable room-messaging gateway")]
struct Args {
    /// Configuration file; replaces the default search path.
    #[arg(short, long, env = "ROOMCAST_CONFIG_FILE", value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting Roomcast server on {}:{} (broker {})",
        config.host,
        config.port,
        config.broker.url
    );

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
    }

    // Start the server
    run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag() {
        let args = Args::try_parse_from(["roomcast", "--config", "/etc/roomcast.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/roomcast.toml")));

        let args = Args::try_parse_from(["roomcast", "-c", "local.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("local.toml")));

        let args = Args::try_parse_from(["roomcast", "--config=inline.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("inline.toml")));
    }

    #[test]
    fn test_rejects_unknown_arguments() {
        assert!(Args::try_parse_from(["roomcast", "--port", "80"]).is_err());
        assert!(Args::try_parse_from(["roomcast", "--config"]).is_err());
    }
}
