//! Event Hub Daemon
//!
//! Accepts published events and fans them out to many streaming
//! subscribers over `text/event-stream`.

mod api;
mod client;
mod config;
mod error;
mod hub;
mod models;
mod queue;
mod session;
mod sync;
mod transport;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;

const AURORA_BLUE: &str = "\x1b[38;5;117m";
const COSMIC_VIOLET: &str = "\x1b[38;5;147m";
const PULSE_CYAN: &str = "\x1b[38;5;51m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

#[derive(Parser)]
#[command(name = "event-hub")]
#[command(about = "Broadcast published events to streaming subscribers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Publish one event to a running hub
    Publish {
        /// Topic to publish to
        #[arg(short, long, default_value = api::DEFAULT_TOPIC)]
        topic: String,

        /// Event payload
        data: String,

        /// Hub base URL (defaults to the configured host and port)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Print events from a topic as they arrive
    Listen {
        /// Topic to follow
        #[arg(short, long, default_value = api::DEFAULT_TOPIC)]
        topic: String,

        /// Hub base URL (defaults to the configured host and port)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Manage configuration (prints the config file path by default)
    Config {
        /// Show current configuration
        #[arg(short, long, conflicts_with = "init")]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },

    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;

    // `listen` writes events to stdout; keep its logs quiet unless asked.
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if matches!(cli.command, Commands::Serve { .. }) {
        config.log_level.as_str()
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Publish { topic, data, url } => {
            let url = url.unwrap_or_else(|| config.base_url());
            let sequence = client::publish(&url, &topic, data).await?;
            println!("{}✓{} published to {} (seq {})", PULSE_CYAN, RESET, topic, sequence);
        }
        Commands::Listen { topic, url } => {
            let url = url.unwrap_or_else(|| config.base_url());
            client::listen(&url, &topic).await?;
        }
        Commands::Config { show, init } => {
            manage_config(cli.config.as_deref(), &config, show, init)?;
        }
        Commands::Version => {
            print_version();
        }
    }

    Ok(())
}

/// Print styled version
fn print_version() {
    println!(
        "  {}✦{} {}Event Hub{} {}v{}{}",
        BOLD, RESET, BOLD, RESET, AURORA_BLUE, env!("CARGO_PKG_VERSION"), RESET
    );
}

async fn run_server(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.http_port = port;
    }
    config.validate()?;

    println!("{}✦ EVENT HUB ✦{} v{}", AURORA_BLUE, RESET, env!("CARGO_PKG_VERSION"));
    println!(
        "  {}🌐 {}{}  {}overflow: {}, default capacity: {}{}",
        COSMIC_VIOLET,
        config.base_url(),
        RESET,
        DIM,
        config.overflow_policy,
        config.default_capacity,
        RESET
    );

    let hub = hub::Hub::new(config.overflow_policy, config.max_idle_topics);
    info!("Starting event hub");
    api::run_web_server(config, hub).await?;

    println!("  {}✦ Shut down gracefully{}", COSMIC_VIOLET, RESET);
    Ok(())
}

fn manage_config(path: Option<&str>, config: &Config, show: bool, init: bool) -> Result<()> {
    let path = path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    if init {
        Config::default().save(&path)?;
        println!("{}✦ Configuration created at {}{}", PULSE_CYAN, path.display(), RESET);
    } else if show {
        if !path.exists() {
            println!("{}✦ No config file found, showing defaults{}", COSMIC_VIOLET, RESET);
        }
        println!("{}✦ Configuration ({}){}", AURORA_BLUE, path.display(), RESET);
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        let status = if path.exists() { "" } else { " (not created)" };
        println!("{}✦ Config file: {}{}{}", AURORA_BLUE, path.display(), status, RESET);
        println!("  {}Use --show to print it or --init to create it{}", DIM, RESET);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_flags(args: &[&str]) -> Option<(bool, bool)> {
        match Cli::try_parse_from(args).ok()?.command {
            Commands::Config { show, init } => Some((show, init)),
            _ => None,
        }
    }

    #[test]
    fn test_config_flags() {
        assert_eq!(config_flags(&["event-hub", "config"]), Some((false, false)));
        assert_eq!(config_flags(&["event-hub", "config", "--show"]), Some((true, false)));
        assert_eq!(config_flags(&["event-hub", "config", "-i"]), Some((false, true)));
        assert_eq!(config_flags(&["event-hub", "config", "--show", "--init"]), None);
    }

    #[test]
    fn test_config_without_flags_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path_str = path.to_str().unwrap();

        manage_config(Some(path_str), &Config::default(), false, false).unwrap();
        manage_config(Some(path_str), &Config::default(), true, false).unwrap();
        assert!(!path.exists());

        manage_config(Some(path_str), &Config::default(), false, true).unwrap();
        assert!(Config::load(&path).is_ok());
    }
}
