//! EmberKV server entry point.
//!
//! Sets up logging, restores the last snapshot, starts the background tasks
//! and accepts connections until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use emberkv::commands::CommandHandler;
use emberkv::connection::{handle_connection, log_summary, ConnectionStats};
use emberkv::persistence::{Persistence, PersistenceConfig, SnapshotScheduler};
use emberkv::storage::{ExpiryConfig, ExpirySweeper, Store};
use emberkv::{DEFAULT_HOST, DEFAULT_PORT, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "emberkv", version, about = "EmberKV - in-memory key-value cache")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Snapshot file
    #[arg(long, value_name = "FILE", default_value = "dump.ekv")]
    snapshot: PathBuf,

    /// Seconds between periodic snapshots (0 disables the timer)
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    save_interval: u64,

    /// Run purely in memory: no load, no saves
    #[arg(long)]
    no_persistence: bool,

    /// Skip the final snapshot at shutdown
    #[arg(long)]
    no_save_on_shutdown: bool,

    /// Longest the expiry sweeper sleeps between passes
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    expiry_max_interval_ms: u64,

    /// Expiry records examined per shard per lock hold
    #[arg(long, value_name = "N", default_value_t = 256)]
    expiry_scan_cap: usize,
}

impl Args {
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn expiry_config(&self) -> ExpiryConfig {
        ExpiryConfig {
            max_interval: Duration::from_millis(self.expiry_max_interval_ms.max(1)),
            scan_cap: self.expiry_scan_cap.max(1),
        }
    }

    fn persistence_config(&self) -> Option<PersistenceConfig> {
        if self.no_persistence {
            return None;
        }
        Some(PersistenceConfig {
            path: self.snapshot.clone(),
            interval: (self.save_interval > 0).then(|| Duration::from_secs(self.save_interval)),
            save_on_shutdown: !self.no_save_on_shutdown,
        })
    }
}

fn print_banner(args: &Args) {
    println!(
        r#"
  ___       _              _  ____   __
 | __|_ __ | |__  ___ _ _ | |/ /\ \ / /
 | _|| '  \| '_ \/ -_) '_|| ' <  \ V /
 |___|_|_|_|_.__/\___|_|  |_|\_\  \_/

EmberKV v{} - in-memory key-value cache
──────────────────────────────────────────
Listening on {}
Use Ctrl+C to shut down gracefully.
"#,
        VERSION,
        args.bind_address()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emberkv=info".into()),
        )
        .with_target(false)
        .init();

    let store = Arc::new(Store::new());

    // A corrupt snapshot is fatal; a missing one is a first run
    let snapshots = match args.persistence_config() {
        Some(config) => {
            let persistence = Arc::new(Persistence::new(Arc::clone(&store), config.path.clone()));
            let loaded = persistence
                .load()
                .with_context(|| format!("failed to load snapshot {}", config.path.display()))?;
            info!(keys = loaded.loaded, expired = loaded.dropped, "Store restored");
            Some(SnapshotScheduler::with_persistence(persistence, config))
        }
        None => {
            info!("Persistence disabled");
            None
        }
    };

    let sweeper = ExpirySweeper::start(Arc::clone(&store), args.expiry_config());

    let listener = TcpListener::bind(args.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", args.bind_address()))?;
    print_banner(&args);
    info!(address = %args.bind_address(), "Server started");

    let stats = Arc::new(ConnectionStats::new());
    let handler = match &snapshots {
        Some(scheduler) => CommandHandler::with_saver(Arc::clone(&store), scheduler.trigger()),
        None => CommandHandler::new(Arc::clone(&store)),
    };

    tokio::select! {
        _ = accept_loop(listener, handler, Arc::clone(&stats)) => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received, stopping server...");
        }
    }

    sweeper.stop();
    if let Some(scheduler) = snapshots {
        scheduler.shutdown().await;
    }
    log_summary(&stats);

    info!("Server shutdown complete");
    Ok(())
}

/// Accepts connections forever, one task per client.
async fn accept_loop(listener: TcpListener, handler: CommandHandler, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                let stats = Arc::clone(&stats);
                tokio::spawn(handle_connection(stream, addr, handler, stats));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
