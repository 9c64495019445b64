//! `chronicle-replicate`: pull new publications from registered peers.
//!
//! # Usage
//!
//! ```text
//! chronicle-replicate --config chronicle.json                 # poll until Ctrl-C
//! chronicle-replicate --config chronicle.json --once          # one cycle, then exit
//! chronicle-replicate --config chronicle.json --generate-key  # write a new server key
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chronicle_replication::{Identity, ReplicationConfig, ReplicationEngine, Result};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "chronicle-replicate",
    version,
    about = "Replicate signed publications from peer servers"
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(short, long)]
    config: PathBuf,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Generate the server key at `keypair_path` and exit.
    #[arg(long)]
    generate_key: bool,

    /// Log level when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Respects `RUST_LOG` if set, otherwise uses `level`.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "chronicle-replicate failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ReplicationConfig::from_file(&cli.config)?;

    if cli.generate_key {
        let identity = Identity::generate(&config.keypair_path, config.hostname.clone()).await?;
        info!(
            path = %config.keypair_path.display(),
            public_key = %identity.public_key(),
            "Generated server key"
        );
        println!("{}", identity.public_key());
        return Ok(());
    }

    info!(
        directory = %config.directory.display(),
        hostname = %config.hostname,
        "Starting chronicle-replicate"
    );
    let engine = Arc::new(ReplicationEngine::open(config).await?);

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                signal_engine.shutdown();
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
        }
    });

    if cli.once {
        let report = engine.run_cycle().await?;
        info!(
            peers = report.peers.len(),
            stored = report.stored(),
            skipped = report.skipped(),
            failed_peers = report.failed_peers(),
            "Cycle complete"
        );
        return Ok(());
    }

    engine.run().await
}
