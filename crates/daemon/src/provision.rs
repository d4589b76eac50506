//! Provisioning service
//!
//! Orchestrates the peer lifecycle: allocate address, generate keypair, apply
//! to the live interface, persist. Peers move `absent -> active -> inactive`
//! and never come back; a removed peer's key and address are retired and a
//! new request gets a fresh keypair and the next free address.

use crate::alloc::AddressAllocator;
use crate::config::RelayConfig;
use crate::store::{PeerRecord, PeerStore};
use crate::wg::{InterfaceSync, RuntimePeer};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;
use wgrelay_common::{generate_keypair, Error, Result};

/// Result of a successful create-peer operation
#[derive(Debug, Clone)]
pub struct ProvisionedPeer {
    pub peer_id: Uuid,
    pub public_key: String,
    pub assigned_address: Ipv4Addr,
    pub config: String,
}

/// Result of a remove-peer operation
#[derive(Debug, Clone)]
pub struct RemoveOutcome {
    /// Whether a store record was actually deactivated. False means the key
    /// was unknown or already removed, which is still success.
    pub deactivated: bool,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Store-active peers that were missing from the runtime and re-applied
    pub reapplied: Vec<String>,
    /// Runtime peers with no active store record; flagged, never evicted
    pub unknown: Vec<String>,
}

/// Peer lifecycle orchestrator
pub struct Provisioner {
    config: RelayConfig,
    store: PeerStore,
    runtime: Arc<dyn InterfaceSync>,
    allocator: AddressAllocator,
    /// Serializes the allocate-then-insert critical section. Two concurrent
    /// creates must not observe the same free address.
    alloc_lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        config: RelayConfig,
        store: PeerStore,
        runtime: Arc<dyn InterfaceSync>,
    ) -> Result<Self> {
        let subnet = config.subnet()?;
        let relay_address = config.relay_address()?;
        Ok(Self {
            allocator: AddressAllocator::new(subnet, relay_address),
            config,
            store,
            runtime,
            alloc_lock: Mutex::new(()),
        })
    }

    /// Provision a new peer: allocate the lowest free address, generate a
    /// keypair, apply to the runtime, persist, and build the client config.
    ///
    /// The runtime apply happens before the store insert so a runtime
    /// rejection never leaves an orphaned record claiming an address the
    /// interface does not honor.
    pub async fn create_peer(&self, identity: &str, label: &str) -> Result<ProvisionedPeer> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(Error::Validation("identity must not be empty".to_string()));
        }
        let label = if label.trim().is_empty() {
            "device"
        } else {
            label.trim()
        };

        // Fetch the relay key up front: if the runtime is unreachable the
        // request dies here, before anything is allocated or mutated.
        let server_public_key = self.runtime.server_public_key().await?;

        let guard = self.alloc_lock.lock().await;

        let in_use = self.store.active_addresses()?;
        let address = match self.allocator.next_available(&in_use) {
            Some(address) => address,
            None => {
                warn!(
                    "Address pool exhausted: all {} slots in {} are held",
                    self.allocator.capacity(),
                    self.allocator.subnet()
                );
                return Err(Error::Capacity {
                    subnet: self.allocator.subnet().to_string(),
                });
            }
        };

        let keypair = generate_keypair()?;

        self.runtime.apply_peer(&keypair.public_key, address).await?;

        let record = PeerRecord {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            label: label.to_string(),
            public_key: keypair.public_key.clone(),
            private_key: keypair.private_key.clone(),
            assigned_address: address,
            active: true,
            created_at: chrono::Utc::now().timestamp(),
            deactivated_at: None,
        };

        if let Err(e) = self.store.insert(&record) {
            // The runtime accepted a peer we failed to persist. Back it out
            // so the interface does not accumulate untracked peers; the
            // reconciler flags any survivor of a failed cleanup.
            if e.is_constraint_violation() {
                error!(
                    "store constraint violated under allocation lock (allocator bug?): {}",
                    e
                );
            }
            if let Err(cleanup) = self.runtime.remove_peer(&keypair.public_key).await {
                error!(
                    "failed to back out runtime peer {} after store error: {}",
                    keypair.public_key, cleanup
                );
            }
            return Err(e);
        }

        drop(guard);

        info!(
            "Provisioned peer {} ({}) for {} at {}",
            record.id, record.label, record.identity, address
        );

        Ok(ProvisionedPeer {
            peer_id: record.id,
            public_key: keypair.public_key,
            assigned_address: address,
            config: self.render_client_config(&keypair.private_key, address, &server_public_key),
        })
    }

    /// Remove a peer. Idempotent: the caller's intent is "this peer should
    /// not exist", so an unknown or already-removed key is zero-effect
    /// success, never an error.
    pub async fn remove_peer(&self, public_key: &str) -> Result<RemoveOutcome> {
        self.runtime.remove_peer(public_key).await?;

        let affected = self.store.deactivate(public_key)?;
        if affected > 0 {
            info!("Removed peer {}", public_key);
        }
        Ok(RemoveOutcome {
            deactivated: affected > 0,
        })
    }

    /// Rebuild the client configuration for an existing active peer.
    ///
    /// Never regenerates keys; the text is rebuilt from stored fields plus
    /// the current relay key so endpoint changes propagate automatically.
    pub async fn get_config(&self, public_key: &str) -> Result<String> {
        let peer = self
            .store
            .find_active(public_key)?
            .ok_or_else(|| Error::PeerNotFound {
                public_key: public_key.to_string(),
            })?;

        let server_public_key = self.runtime.server_public_key().await?;
        Ok(self.render_client_config(&peer.private_key, peer.assigned_address, &server_public_key))
    }

    /// Live peer table. The runtime is authoritative for liveness and
    /// traffic counters, so this bypasses the store entirely.
    pub async fn list_peers(&self) -> Result<Vec<RuntimePeer>> {
        self.runtime.dump().await
    }

    /// Runtime status for a single peer, if present
    pub async fn peer_status(&self, public_key: &str) -> Result<Option<RuntimePeer>> {
        let peers = self.runtime.dump().await?;
        Ok(peers.into_iter().find(|p| p.public_key == public_key))
    }

    /// Compare store against runtime and correct divergence: re-apply active
    /// peers the runtime lost, flag runtime peers the store does not know.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let runtime_peers = self.runtime.dump().await?;
        let store_peers = self.store.list_active()?;

        let runtime_keys: std::collections::HashSet<&str> =
            runtime_peers.iter().map(|p| p.public_key.as_str()).collect();
        let store_keys: std::collections::HashSet<&str> =
            store_peers.iter().map(|p| p.public_key.as_str()).collect();

        let mut report = ReconcileReport::default();

        for peer in &store_peers {
            if !runtime_keys.contains(peer.public_key.as_str()) {
                match self
                    .runtime
                    .apply_peer(&peer.public_key, peer.assigned_address)
                    .await
                {
                    Ok(()) => {
                        info!(
                            "Reconciled peer {} back into runtime at {}",
                            peer.public_key, peer.assigned_address
                        );
                        report.reapplied.push(peer.public_key.clone());
                    }
                    Err(e) => {
                        warn!("Failed to re-apply peer {}: {}", peer.public_key, e);
                    }
                }
            }
        }

        for peer in &runtime_peers {
            if !store_keys.contains(peer.public_key.as_str()) {
                // Untracked runtime peers are a capacity leak; surface them
                // for the operator instead of silently evicting.
                warn!(
                    "Runtime peer {} has no active store record",
                    peer.public_key
                );
                report.unknown.push(peer.public_key.clone());
            }
        }

        Ok(report)
    }

    /// Whether the underlying interface answers control calls
    pub async fn runtime_up(&self) -> bool {
        self.runtime.is_up().await
    }

    /// The relay's current public key
    pub async fn server_public_key(&self) -> Result<String> {
        self.runtime.server_public_key().await
    }

    /// Active peer count from the store
    pub fn active_peer_count(&self) -> Result<usize> {
        self.store.count_active()
    }

    fn render_client_config(
        &self,
        private_key: &str,
        address: Ipv4Addr,
        server_public_key: &str,
    ) -> String {
        format!(
            "[Interface]\n\
             PrivateKey = {private_key}\n\
             Address = {address}/32\n\
             DNS = {dns}\n\
             \n\
             [Peer]\n\
             PublicKey = {server_public_key}\n\
             Endpoint = {endpoint}\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             PersistentKeepalive = {keepalive}\n",
            private_key = private_key,
            address = address,
            dns = self.config.wireguard.dns,
            server_public_key = server_public_key,
            endpoint = self.config.endpoint(),
            keepalive = self.config.wireguard.keepalive,
        )
    }
}
