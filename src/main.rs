//! ==============================================================================
//! main.rs - fleet authority entry point
//! ==============================================================================
//!
//! purpose:
//!     runs the authority as a long-lived process. relay servers (or whatever
//!     fronts them) write one JSON unit per line to stdin; each answer goes
//!     back as one JSON line on stdout. logs go to stderr.
//!
//! responsibilities:
//!     - load authority.toml (path in argv[1], otherwise the default search)
//!     - initialize tracing (RUST_LOG wins over the configured level)
//!     - start the single-writer service
//!     - tick the liveness sweep
//!     - pump stdin lines into the service until ctrl-c
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────┐
//!     │                    process (this file)                  │
//!     │  ┌─────────────┐   ┌─────────────┐                      │
//!     │  │ stdin lines │   │ sweep ticker│                      │
//!     │  └──────┬──────┘   └──────┬──────┘                      │
//!     │         └────────┬────────┘                             │
//!     │            ┌─────┴─────┐                                │
//!     │            │  service  │ <- service.rs (owns documents) │
//!     │            └─────┬─────┘                                │
//!     └──────────────────┼──────────────────────────────────────┘
//!                        ▼
//!            data/registry.json, devices.json, servers.json,
//!            projects.json, history/<id>.log
//!
//! ==============================================================================

use anyhow::{Context, Result};
use fleet_authority::alert::LogSink;
use fleet_authority::config::{AuthorityConfig, ConfigOrigin};
use fleet_authority::engine::{Authority, Unit};
use fleet_authority::service::{self, AuthorityHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let (config, origin) = match std::env::args().nth(1) {
        Some(path) => (AuthorityConfig::load(&path)?, ConfigOrigin::file(path)),
        None => AuthorityConfig::load_or_default(),
    };

    // step 2: logging to stderr, stdout carries replies
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("fleet authority {}", env!("CARGO_PKG_VERSION"));
    origin.log();
    config.log_summary();

    // step 3: load documents and start the writer
    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("cannot create {}", config.storage.data_dir.display()))?;
    let sweep_every = std::time::Duration::from_secs(config.service.sweep_interval_secs.max(1));
    let queue_depth = config.service.queue_depth;
    let authority = Authority::open(config);
    let (handle, worker) = service::spawn(authority, LogSink, queue_depth);

    // step 4: liveness sweep in background
    let sweeper = tokio::spawn(sweep_loop(handle.clone(), sweep_every));

    // step 5: units from stdin until ctrl-c
    tokio::select! {
        result = read_units(handle.clone()) => {
            if let Err(e) = result {
                tracing::error!("input failed: {:#}", e);
            }
            tracing::info!("input closed, sweeping until ctrl-c");
            tokio::signal::ctrl_c().await?;
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    tracing::info!("shutting down");
    sweeper.abort();
    drop(handle);
    worker.await.context("authority service panicked")?;
    Ok(())
}

async fn sweep_loop(handle: AuthorityHandle, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match handle.submit(Unit::Sweep).await {
            Ok(response) if !response.outcome.alerts.is_empty() => {
                tracing::debug!("sweep raised {} alerts", response.outcome.alerts.len());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("sweep stopped: {}", e);
                return;
            }
        }
    }
}

async fn read_units(handle: AuthorityHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let unit: Unit = match serde_json::from_str(&line) {
            Ok(unit) => unit,
            Err(e) => {
                tracing::warn!("unreadable unit: {}", e);
                println!("{}", serde_json::json!({ "error": e.to_string() }));
                continue;
            }
        };
        let response = handle.submit(unit).await?;
        println!("{}", serde_json::to_string(&response)?);
    }
    Ok(())
}
