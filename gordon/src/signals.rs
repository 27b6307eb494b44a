//! Signal-driven IPC surface of the running process.
//!
//! SIGTERM/SIGINT cancel the root token; SIGUSR1 publishes
//! `manual-reload`; SIGUSR2 consumes the deploy-request file and
//! publishes `manual-deploy`. The request file is written with a
//! rename so the reader never observes a half-written line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gordon_common::DomainName;

use crate::bus::{Event, EventBus};

pub fn deploy_request_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("deploy-request")
}

pub fn pid_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("gordon.pid")
}

/// Atomically place a deploy request for the running process to pick
/// up on SIGUSR2.
pub async fn write_deploy_request(path: &Path, domain: &DomainName) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, format!("{domain}\n")).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// Read and consume the deploy-request file.
async fn take_deploy_request(path: &Path) -> Option<DomainName> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    tokio::fs::remove_file(path).await.ok();
    match raw.lines().next()?.trim().parse() {
        Ok(domain) => Some(domain),
        Err(err) => {
            warn!(%err, "deploy-request file held no usable domain");
            None
        }
    }
}

pub async fn run(bus: Arc<EventBus>, request_path: PathBuf, cancel: CancellationToken) {
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut usr1 =
        signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
    let mut usr2 =
        signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                cancel.cancel();
                break;
            }
            _ = interrupt.recv() => {
                info!("SIGINT received, shutting down");
                cancel.cancel();
                break;
            }
            _ = usr1.recv() => {
                info!("SIGUSR1 received, reloading config");
                if let Err(err) = bus.publish(Event::ManualReload).await {
                    warn!(%err, "manual-reload event dropped");
                }
            }
            _ = usr2.recv() => {
                match take_deploy_request(&request_path).await {
                    Some(domain) => {
                        info!(%domain, "SIGUSR2 received, deploying");
                        if let Err(err) = bus.publish(Event::ManualDeploy { domain }).await {
                            warn!(%err, "manual-deploy event dropped");
                        }
                    }
                    None => warn!("SIGUSR2 received without a deploy request file"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
