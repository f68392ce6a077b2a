use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tabrelay_cli::{server, RelayConfig};

#[derive(Parser)]
#[command(name = "tabrelay", version, about = "Browser tab relay for automation controllers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay: dial (or launch) the browser and serve controllers.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address for the control server.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Existing DevTools websocket url; skips launching Chromium.
    #[arg(long = "ws-url")]
    ws_url: Option<String>,
    /// Path to the sqlite store.
    #[arg(long)]
    store: Option<PathBuf>,
    /// Run the browser with a visible window.
    #[arg(long)]
    headful: bool,
    /// Log filter; overrides TABRELAY_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize logging")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            let mut config = RelayConfig::from_env();
            if let Some(bind) = args.bind {
                config.bind_addr = bind;
            }
            if args.ws_url.is_some() {
                config.websocket_url = args.ws_url;
            }
            if let Some(store) = args.store {
                config.store_path = store;
            }
            if args.headful {
                config.headless = false;
            }
            if let Some(level) = args.log_level {
                config.log_level = level;
            }

            init_logging(&config.log_level)?;
            server::run(config).await
        }
    }
}
