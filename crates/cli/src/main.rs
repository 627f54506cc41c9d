mod scheduler;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use helmsman_core::ConfigLoader;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "helmsman", about = "Multi-symbol trading supervisor", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/helmsman.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::load(&cli.config)?;
    tracing::info!(
        symbols = config.monitor.symbols.len(),
        intervals = ?config.monitor.intervals,
        "starting supervisor"
    );
    supervisor::run(config).await
}
