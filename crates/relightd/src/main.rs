//! relightd: the relight daemon.
//!
//! Single binary that assembles the routing stack:
//! - Slicer control plane client
//! - VM state manager (cached lookups, coalesced wakes)
//! - Idle watcher
//! - Proxy listener and optional on-demand TLS ask listener
//!
//! # Usage
//!
//! ```text
//! relightd run --config /etc/relight/relight.toml
//! relightd check --config /etc/relight/relight.toml
//! ```

mod daemon;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,relightd=debug,relight=debug";

#[derive(Parser)]
#[command(name = "relightd", about = "Scale-to-zero router for microVMs", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the router.
    Run {
        /// Path to relight.toml.
        #[arg(long, short, default_value = "relight.toml")]
        config: PathBuf,

        /// Proxy listen address (overrides `server.listen`).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Ask listen address (overrides `server.ask_listen`).
        #[arg(long)]
        ask_listen: Option<SocketAddr>,
    },

    /// Validate a config file and print the effective settings.
    Check {
        /// Path to relight.toml.
        #[arg(long, short, default_value = "relight.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            listen,
            ask_listen,
        } => {
            let config = daemon::load_config(&config, listen, ask_listen)?;
            daemon::run(config).await
        }
        Command::Check { config } => {
            let config = daemon::load_config(&config, None, None)?;
            print!("{}", daemon::render_effective(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
