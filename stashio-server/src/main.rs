mod config;
mod server;

use clap::Parser;
use config::{Config, Env};
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "stashio")]
#[command(about = "Distributed content-addressable blob storage node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Bootstrap ring membership from the configured sync node
    #[arg(long)]
    sync: bool,

    /// Announce this node to every known member after sync
    #[arg(long = "announce-new")]
    announce_new: bool,
}

fn init_tracing(env: Env) {
    let default_filter = match env {
        Env::Dev => "stashio=debug,stashio_core=debug",
        Env::Prod => "stashio=info,stashio_core=info",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("Failed to load config '{}': {}", cli.config, error);
            std::process::exit(1);
        }
    };

    init_tracing(cfg.env);
    cfg.validate();

    tracing::info!("Starting stashio node with config: {}", cli.config);

    if let Err(error) = run_server(cfg, cli.sync, cli.announce_new).await {
        tracing::error!("Server error: {}", error);
        std::process::exit(1);
    }

    tracing::info!("Gracefully stopped");
}
