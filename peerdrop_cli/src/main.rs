mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use peerdrop_core::link::quic::{accept_peers, connect_peer, make_client_endpoint, make_server_endpoint};
use peerdrop_core::store::{BatchStore, FsBatchStore};
use peerdrop_core::transfer::TransferPhase;
use peerdrop_core::transfer::utils::{format_transfer_speed, write_received_file};
use peerdrop_core::{TransferConfig, TransferEvent, spawn_session};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => TransferConfig::load_from(path),
        None => TransferConfig::load(),
    };
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::Receive { bind, out } => receive(config, bind, out).await,
        Command::Send { peer, files } => {
            if !send(config, peer, files).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save().context("saving configuration")?;
                info!("Configuration saved");
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn batch_store(config: &TransferConfig) -> Arc<dyn BatchStore> {
    Arc::new(FsBatchStore::new(&config.storage_dir))
}

async fn receive(config: TransferConfig, bind: SocketAddr, out: Option<PathBuf>) -> Result<()> {
    let download_dir = out.unwrap_or_else(|| config.download_dir.clone());
    let endpoint = make_server_endpoint(bind).context("starting QUIC endpoint")?;
    info!(
        "Listening on {}, saving to {}",
        endpoint.local_addr()?,
        download_dir.display()
    );

    let (handle, mut events, task) = spawn_session(config.clone(), batch_store(&config))?;
    tokio::spawn(accept_peers(endpoint.clone(), handle.clone(), config));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => on_receive_event(event, &download_dir).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    endpoint.close(0u32.into(), b"shutdown");
    let _ = task.await;
    Ok(())
}

async fn on_receive_event(event: TransferEvent, download_dir: &Path) {
    match event {
        TransferEvent::FileReceived {
            name, data, sender, ..
        } => match write_received_file(download_dir, &name, &data).await {
            Ok(path) => info!("Saved {} from {} to {}", name, sender, path.display()),
            Err(e) => error!("Failed to save {}: {}", name, e),
        },
        TransferEvent::Progress {
            file_id, percent, ..
        } => debug!("{}: {}%", file_id, percent),
        TransferEvent::Status(status) => info!("{}", status),
        TransferEvent::Error(message) => warn!("{}", message),
        _ => {}
    }
}

/// Returns true when every file resolved `Completed`
async fn send(config: TransferConfig, peer: SocketAddr, files: Vec<PathBuf>) -> Result<bool> {
    let mut total_bytes = 0u64;
    for file in &files {
        total_bytes += tokio::fs::metadata(file)
            .await
            .with_context(|| format!("cannot read {}", file.display()))?
            .len();
    }

    let endpoint = make_client_endpoint().context("starting QUIC endpoint")?;
    let (handle, mut events, task) = spawn_session(config.clone(), batch_store(&config))?;
    let peer_id = connect_peer(&endpoint, peer, &handle, &config)
        .await
        .with_context(|| format!("connecting to {peer}"))?;
    info!("Connected to {}", peer_id);

    let started = Instant::now();
    let mut pending = HashSet::new();
    for file in &files {
        let file_id = handle
            .send_file(file)
            .await
            .with_context(|| format!("sending {}", file.display()))?;
        pending.insert(file_id);
    }

    let mut all_completed = true;
    while !pending.is_empty() {
        match events.recv().await {
            Some(TransferEvent::TransferOutcome { file_id, summary }) => {
                pending.remove(&file_id);
                if summary.phase == TransferPhase::Completed {
                    info!("{} delivered", summary.file_name);
                } else {
                    all_completed = false;
                    error!(
                        "{} ended {:?} (failed: {:?})",
                        summary.file_name, summary.phase, summary.failed
                    );
                }
            }
            Some(TransferEvent::Progress {
                file_id, percent, ..
            }) => debug!("{}: {}%", file_id, percent),
            Some(TransferEvent::Error(message)) => warn!("{}", message),
            Some(_) => {}
            None => bail!("session stopped before all files resolved"),
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        "Sent {} file(s), {} bytes in {:.1}s ({})",
        files.len(),
        total_bytes,
        elapsed,
        format_transfer_speed(total_bytes, elapsed)
    );

    handle.shutdown().await;
    endpoint.close(0u32.into(), b"done");
    endpoint.wait_idle().await;
    let _ = task.await;
    Ok(all_completed)
}
