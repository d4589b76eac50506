//! Interface synchronizer
//!
//! Applies peer add/remove operations to the live WireGuard interface and
//! reads back its authoritative peer statistics. The control mechanism is
//! behind a trait so the subprocess `wg` implementation can be swapped for a
//! native binding without touching orchestration logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};
use wgrelay_common::{Error, Result};

/// One peer as reported by the live runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimePeer {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: String,
    pub latest_handshake: Option<i64>,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
}

/// Control surface over the live tunnel runtime
#[async_trait]
pub trait InterfaceSync: Send + Sync {
    /// Accept traffic for `address` from `public_key`. Idempotent.
    async fn apply_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()>;

    /// Stop accepting traffic for `public_key`. Idempotent; removing an
    /// absent peer is a no-op success.
    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// Authoritative live peer table with handshake and transfer counters
    async fn dump(&self) -> Result<Vec<RuntimePeer>>;

    /// The relay's own public key
    async fn server_public_key(&self) -> Result<String>;

    /// Whether the interface is up and answering control calls
    async fn is_up(&self) -> bool;
}

// ============================================================================
// wg(8) subprocess implementation
// ============================================================================

/// Runtime control via the `wg` command-line tool
pub struct WgCli {
    interface: String,
    timeout: Duration,
}

impl WgCli {
    pub fn new(interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            timeout,
        }
    }

    /// Run a `wg` subcommand under the control timeout.
    ///
    /// Raw stderr is logged here and never propagated: callers receive a
    /// sanitized `RuntimeSync` describing the operation, not the tool output.
    async fn run(&self, args: &[&str], op: &str) -> Result<String> {
        debug!("wg {}", args.join(" "));
        let output = tokio::time::timeout(self.timeout, Command::new("wg").args(args).output())
            .await
            .map_err(|_| {
                error!("wg {} timed out after {:?}", op, self.timeout);
                Error::RuntimeSync(format!("{} timed out", op))
            })?
            .map_err(|e| {
                error!("failed to invoke wg for {}: {}", op, e);
                Error::RuntimeSync(format!("{} could not invoke runtime tool", op))
            })?;

        if !output.status.success() {
            error!(
                "wg {} failed with {}: {}",
                op,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(Error::RuntimeSync(format!("{} rejected by runtime", op)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl InterfaceSync for WgCli {
    async fn apply_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let allowed = format!("{}/32", address);
        self.run(
            &[
                "set",
                &self.interface,
                "peer",
                public_key,
                "allowed-ips",
                &allowed,
            ],
            "apply-peer",
        )
        .await?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        // `wg set ... peer <key> remove` succeeds for absent peers, which is
        // exactly the idempotency the remove path relies on.
        self.run(
            &["set", &self.interface, "peer", public_key, "remove"],
            "remove-peer",
        )
        .await?;
        Ok(())
    }

    async fn dump(&self) -> Result<Vec<RuntimePeer>> {
        let output = self.run(&["show", &self.interface, "dump"], "dump").await?;
        Ok(parse_dump(&output))
    }

    async fn server_public_key(&self) -> Result<String> {
        let output = self
            .run(&["show", &self.interface, "public-key"], "public-key")
            .await?;
        let key = output.trim().to_string();
        if key.is_empty() {
            return Err(Error::RuntimeSync(
                "runtime returned empty public key".to_string(),
            ));
        }
        Ok(key)
    }

    async fn is_up(&self) -> bool {
        self.run(&["show", &self.interface], "show").await.is_ok()
    }
}

/// Parse `wg show <interface> dump` output.
///
/// Tab-separated; the first line describes the interface itself, each
/// following line one peer: public-key, preshared-key, endpoint, allowed-ips,
/// latest-handshake, transfer-rx, transfer-tx, keepalive. Absent values are
/// the literal `(none)`, a zero handshake means never.
pub fn parse_dump(output: &str) -> Vec<RuntimePeer> {
    let mut peers = Vec::new();

    for line in output.lines().skip(1) {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 5 {
            continue;
        }
        peers.push(RuntimePeer {
            public_key: parts[0].to_string(),
            endpoint: match parts[2] {
                "(none)" | "" => None,
                ep => Some(ep.to_string()),
            },
            allowed_ips: parts[3].to_string(),
            latest_handshake: match parts[4].parse::<i64>() {
                Ok(0) | Err(_) => None,
                Ok(ts) => Some(ts),
            },
            transfer_rx: parts.get(5).and_then(|v| v.parse().ok()).unwrap_or(0),
            transfer_tx: parts.get(6).and_then(|v| v.parse().ok()).unwrap_or(0),
        });
    }

    peers
}

// ============================================================================
// In-memory runtime for tests
// ============================================================================
