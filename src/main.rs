//! Pulsefeed CLI - runs the activity distribution server.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pulsefeed::config::Config;
use pulsefeed::server::{serve, StaticTokenAuthenticator};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Git commit the binary was built from, injected by build.rs.
fn git_commit() -> &'static str {
    env!("PF_GIT_COMMIT")
}

/// UTC build timestamp, injected by build.rs.
fn build_timestamp() -> &'static str {
    env!("PF_BUILD_TIMESTAMP")
}

#[derive(Parser)]
#[command(name = "pulsefeed", version, about = "Real-time activity distribution server")]
struct Cli {
    /// Path to a TOML config file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket activity server
    Serve {
        /// Bind host (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print version, commit, and build timestamp
    BuildInfo,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), pulsefeed::Error> {
    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            info!(
                version = env!("CARGO_PKG_VERSION"),
                commit = git_commit(),
                built = build_timestamp(),
                "starting pulsefeed"
            );

            let authenticator = Arc::new(StaticTokenAuthenticator::from(&config.auth));
            let handle = serve(config.server, authenticator).await?;
            info!(addr = %handle.local_addr(), "listening");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            handle.shutdown().await;
            Ok(())
        }
        Commands::BuildInfo => {
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Commit:  {}", git_commit());
            println!("Built:   {}", build_timestamp());
            Ok(())
        }
    }
}
