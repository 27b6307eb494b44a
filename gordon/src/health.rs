//! Readiness probing of freshly started containers.
//!
//! A swap is only committed once the new container answers. HTTP mode
//! treats any response as life, auth walls included; TCP mode just
//! dials. Retries back off 500 ms at a time until the deadline.

use std::net::SocketAddr;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ports assumed to speak HTTP when the probe mode is `auto`.
const HTTP_PORTS: &[u16] = &[80, 3000, 3001, 5000, 8000, 8080, 8081];

static CLIENT: Lazy<Client<HttpConnector>> = Lazy::new(Client::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    #[default]
    Auto,
    Http,
    Tcp,
    None,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct Unready(pub String);

/// Resolve `auto` against the target port.
pub fn effective_mode(mode: ProbeMode, port: u16) -> ProbeMode {
    match mode {
        ProbeMode::Auto => {
            if HTTP_PORTS.contains(&port) {
                ProbeMode::Http
            } else {
                ProbeMode::Tcp
            }
        }
        other => other,
    }
}

/// Probe `addr` until it answers or the timeout elapses.
pub async fn probe(
    addr: SocketAddr,
    mode: ProbeMode,
    path: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Unready> {
    let mode = effective_mode(mode, addr.port());
    if mode == ProbeMode::None {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_reason = "never attempted".to_string();
    loop {
        let attempt = match mode {
            ProbeMode::Http => attempt_http(addr, path).await,
            ProbeMode::Tcp => attempt_tcp(addr).await,
            ProbeMode::Auto | ProbeMode::None => unreachable!("resolved above"),
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(reason) => {
                trace!(%addr, %reason, "probe attempt failed");
                last_reason = reason;
            }
        }

        if tokio::time::Instant::now() + RETRY_BACKOFF >= deadline {
            return Err(Unready(format!(
                "{addr} not ready within {}s: {last_reason}",
                timeout.as_secs()
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(RETRY_BACKOFF) => {}
            _ = cancel.cancelled() => return Err(Unready("probe cancelled".to_string())),
        }
    }
}

async fn attempt_http(addr: SocketAddr, path: &str) -> Result<(), String> {
    let uri: Uri = format!("http://{addr}{path}")
        .parse()
        .map_err(|err| format!("bad probe uri: {err}"))?;
    let response = tokio::time::timeout(ATTEMPT_TIMEOUT, CLIENT.get(uri))
        .await
        .map_err(|_| "http probe timed out".to_string())?
        .map_err(|err| err.to_string())?;

    let status = response.status();
    // A response is life: an app behind an auth wall is still up.
    if status.is_success()
        || status.is_redirection()
        || status == http::StatusCode::UNAUTHORIZED
        || status == http::StatusCode::FORBIDDEN
    {
        Ok(())
    } else {
        Err(format!("unexpected status {status}"))
    }
}

async fn attempt_tcp(addr: SocketAddr) -> Result<(), String> {
    tokio::time::timeout(ATTEMPT_TIMEOUT, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| "tcp probe timed out".to_string())?
        .map(|_| ())
        .map_err(|err| err.to_string())
}
