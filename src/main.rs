use anyhow::Result;
use clap::{Parser, Subcommand};
use policybrief::billing::CREDIT_PACKAGES;
use policybrief::config::Config;
use policybrief::gateway;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "policybrief", version, about = "Freemium policy-memo backend")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Bind host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// List purchasable credit packages.
    Packages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("policybrief=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await
        }
        Command::Packages => {
            for package in CREDIT_PACKAGES {
                println!(
                    "{:<12} {:>3} credits  ${:>6.2}",
                    package.key,
                    package.credits,
                    f64::from(package.amount_cents) / 100.0
                );
            }
            Ok(())
        }
    }
}
