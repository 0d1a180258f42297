use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use kafka_proxy_filters::chain::FilterChain;
use kafka_proxy_filters::commands::{self, Direction};
use kafka_proxy_filters::config::{self, Config};
use kafka_proxy_filters::error::Result;
use kafka_proxy_filters::logging;
use kafka_proxy_filters::plugin::StartOptions;

#[derive(Parser, Debug)]
#[command(name = "kafka-proxy-filters")]
#[command(about = "Load and exercise Kafka proxy filter plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Plugin directory, overrides the configured one
    #[arg(short, long, value_name = "DIR", global = true)]
    plugin_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start every plugin and report the resulting chain (default)
    Check,
    /// Filter a body read from stdin and write the result to stdout
    Pipe {
        /// Kafka API key of the message
        #[arg(long)]
        api_key: i16,
        /// Kafka API version of the message
        #[arg(long, default_value_t = 0)]
        api_version: i16,
        /// Chain direction to apply
        #[arg(long, value_enum, default_value_t = Direction::Request)]
        direction: Direction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_ref()).await?;
    if let Some(dir) = args.plugin_dir {
        config.filters.plugin_dir = dir;
    }

    // Held until exit so file logs are flushed
    let _guard = logging::init(&config.logging, args.debug)?;

    match args.command.unwrap_or(Command::Check) {
        Command::Check => commands::run_chain_check(config).await,
        Command::Pipe {
            api_key,
            api_version,
            direction,
        } => {
            let chain = FilterChain::build_with(
                &config.filters.plugin_dir,
                &StartOptions::from(&config.filters),
            )
            .await?;
            info!("Piping through {} filter(s)", chain.len());

            let result = commands::run_pipe(
                &chain,
                direction,
                api_key,
                api_version,
                tokio::io::stdin(),
                tokio::io::stdout(),
            )
            .await;

            if let Err(e) = &result {
                error!("Pipe failed: {}", e);
            }
            chain.close().await?;
            result
        }
    }
}

// Logging is not installed yet, so failures go straight to stderr
async fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let result = match path {
        Some(path) => config::load_from_path(path).await,
        None => config::load_from_env_or_file().await,
    };
    if let Err(e) = &result {
        eprintln!("Failed to load configuration: {e}");
    }
    result
}
