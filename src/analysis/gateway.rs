//! Urgent-submission gateway on a Unix domain socket.
//!
//! Each connection carries one newline-terminated token address, which is
//! pushed to the front of the analysis line.

use crate::analysis::scheduler::AnalysisScheduler;
use crate::config::GatewaySettings;
use crate::types::Pubkey;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate a submitted line as a base58 32-byte public key.
pub fn parse_address(line: &str) -> Option<Pubkey> {
    let candidate = line.trim();
    if candidate.is_empty() {
        return None;
    }
    solana_sdk::pubkey::Pubkey::from_str(candidate)
        .ok()
        .map(|key| key.to_string())
}

pub struct UrgentGateway {
    listener: UnixListener,
    path: PathBuf,
    read_timeout: Duration,
    scheduler: Arc<AnalysisScheduler>,
}

impl UrgentGateway {
    /// Bind the socket, replacing a leftover socket file.
    pub fn bind(settings: &GatewaySettings, scheduler: Arc<AnalysisScheduler>) -> Result<Self> {
        let path = PathBuf::from(&settings.socket_path);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind urgent gateway at {}", path.display()))?;
        info!("Urgent gateway listening on {}", path.display());

        Ok(Self {
            listener,
            path,
            read_timeout: settings.read_timeout(),
            scheduler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until cancelled. The socket file is removed on return.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _)) => {
                    let scheduler = self.scheduler.clone();
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        if let Some(address) = read_submission(stream, read_timeout).await {
                            scheduler.submit_urgent_analysis(&address);
                        }
                    });
                }
                Err(e) => error!("Urgent gateway accept failed: {}", e),
            }
        }
        info!("Urgent gateway on {} stopped", self.path().display());
    }
}

impl Drop for UrgentGateway {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}

async fn read_submission(stream: UnixStream, read_timeout: Duration) -> Option<Pubkey> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    match timeout(read_timeout, reader.read_line(&mut line)).await {
        Err(_) => {
            warn!("Urgent submission timed out");
            None
        }
        Ok(Err(e)) => {
            warn!("Failed to read urgent submission: {}", e);
            None
        }
        Ok(Ok(_)) => {
            let address = parse_address(&line);
            if address.is_none() {
                warn!("Ignoring invalid urgent submission {:?}", line.trim());
            }
            address
        }
    }
}

/// Send one address to a running gateway.
pub async fn submit_urgent(path: impl AsRef<Path>, address: &str) -> Result<()> {
    let path = path.as_ref();
    let mut stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
        .await
        .with_context(|| format!("Timed out connecting to {}", path.display()))?
        .with_context(|| format!("Failed to connect to {}", path.display()))?;

    stream
        .write_all(format!("{}\n", address.trim()).as_bytes())
        .await
        .context("Failed to write submission")?;
    stream.shutdown().await.context("Failed to close connection")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let valid = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr";
        assert_eq!(parse_address(&format!("{}\n", valid)).as_deref(), Some(valid));
        assert_eq!(parse_address(&format!("  {}  ", valid)).as_deref(), Some(valid));
        assert!(parse_address("").is_none());
        assert!(parse_address("\n").is_none());
        assert!(parse_address("not-a-key").is_none());
        // Valid base58, wrong length
        assert!(parse_address("3yZe7d").is_none());
    }
}
