//! Peer store
//!
//! Durable record of every peer provisioned on this relay. Rows are never
//! physically deleted: remove marks a peer inactive and its address becomes
//! eligible for reuse. The store is the single source of truth for address
//! allocation; the live interface is authoritative only for handshake and
//! traffic statistics.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::info;
use uuid::Uuid;
use wgrelay_common::{Database, Error, Result};

/// One provisioned peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: Uuid,
    pub identity: String,
    pub label: String,
    pub public_key: String,
    pub private_key: String,
    pub assigned_address: Ipv4Addr,
    pub active: bool,
    pub created_at: i64,
    pub deactivated_at: Option<i64>,
}

/// Peer store over the shared state database
#[derive(Clone)]
pub struct PeerStore {
    db: Database,
}

impl PeerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Initialize peer schema
    ///
    /// The partial unique index on active addresses is the backstop for the
    /// allocation critical section: even a locking bug cannot double-assign.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                label TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                private_key TEXT NOT NULL,
                assigned_address TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                deactivated_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_peers_identity ON peers(identity);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_active_address
                ON peers(assigned_address) WHERE active = 1;
            "#,
        )?;

        info!("Peer store schema initialized");
        Ok(())
    }

    /// Insert a new peer record.
    ///
    /// Fails with `DuplicateKey` if the public key was ever registered
    /// (active or retired), `DuplicateAddress` if the address is held by an
    /// active peer.
    pub fn insert(&self, peer: &PeerRecord) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let result = conn.execute(
            "INSERT INTO peers (id, identity, label, public_key, private_key, assigned_address, active, created_at, deactivated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                peer.id.to_string(),
                peer.identity,
                peer.label,
                peer.public_key,
                peer.private_key,
                peer.assigned_address.to_string(),
                peer.active,
                peer.created_at,
                peer.deactivated_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, Some(msg)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                if msg.contains("public_key") {
                    Err(Error::DuplicateKey {
                        public_key: peer.public_key.clone(),
                    })
                } else {
                    Err(Error::DuplicateAddress {
                        address: peer.assigned_address.to_string(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a peer inactive. Returns the affected-row count; zero means the
    /// key was unknown or already inactive, which callers treat as a no-op.
    pub fn deactivate(&self, public_key: &str) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.connection();
        let conn = conn.lock();
        let affected = conn.execute(
            "UPDATE peers SET active = 0, deactivated_at = ?1 WHERE public_key = ?2 AND active = 1",
            params![now, public_key],
        )?;
        Ok(affected)
    }

    /// Look up an active peer by public key
    pub fn find_active(&self, public_key: &str) -> Result<Option<PeerRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, identity, label, public_key, private_key, assigned_address, active, created_at, deactivated_at
             FROM peers WHERE public_key = ?1 AND active = 1",
            params![public_key],
            row_to_peer,
        )
        .optional()
        .map_err(Into::into)
    }

    /// List all active peers, oldest first
    pub fn list_active(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identity, label, public_key, private_key, assigned_address, active, created_at, deactivated_at
             FROM peers WHERE active = 1 ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_peer)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    /// Addresses held by active peers
    pub fn active_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        Ok(self
            .list_active()?
            .iter()
            .map(|p| p.assigned_address)
            .collect())
    }

    /// Number of active peers
    pub fn count_active(&self) -> Result<usize> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM peers WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRecord> {
    Ok(PeerRecord {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
        identity: row.get(1)?,
        label: row.get(2)?,
        public_key: row.get(3)?,
        private_key: row.get(4)?,
        assigned_address: row.get::<_, String>(5)?.parse().unwrap(),
        active: row.get(6)?,
        created_at: row.get(7)?,
        deactivated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> PeerStore {
        let db = Database::open_memory().unwrap();
        let store = PeerStore::new(db);
        store.init_schema().unwrap();
        store
    }

    fn test_peer(key: &str, address: Ipv4Addr) -> PeerRecord {
        PeerRecord {
            id: Uuid::new_v4(),
            identity: "u1".to_string(),
            label: "phone".to_string(),
            public_key: key.to_string(),
            private_key: format!("priv-{}", key),
            assigned_address: address,
            active: true,
            created_at: chrono::Utc::now().timestamp(),
            deactivated_at: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let store = test_store();
        let peer = test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2));
        store.insert(&peer).unwrap();

        let found = store.find_active("pk1").unwrap().unwrap();
        assert_eq!(found.id, peer.id);
        assert_eq!(found.assigned_address, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(found.private_key, "priv-pk1");

        assert!(store.find_active("pk2").unwrap().is_none());
        assert_eq!(store.count_active().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();

        let err = store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 3)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn test_duplicate_key_rejected_even_after_deactivate() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();
        store.deactivate("pk1").unwrap();

        // Key stays retired forever, even though the address freed up
        let err = store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();

        let err = store
            .insert(&test_peer("pk2", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAddress { .. }));
    }

    #[test]
    fn test_address_reusable_after_deactivate() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();
        assert_eq!(store.deactivate("pk1").unwrap(), 1);

        store
            .insert(&test_peer("pk2", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();
        assert_eq!(store.count_active().unwrap(), 1);
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();

        assert_eq!(store.deactivate("pk1").unwrap(), 1);
        assert_eq!(store.deactivate("pk1").unwrap(), 0);
        assert_eq!(store.deactivate("never-existed").unwrap(), 0);
    }

    #[test]
    fn test_deactivated_peer_keeps_history() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();
        store.deactivate("pk1").unwrap();

        // Not visible through the active view
        assert!(store.find_active("pk1").unwrap().is_none());

        // But the row survives for audit
        let conn = store.db.connection();
        let conn = conn.lock();
        let (active, deactivated_at): (bool, Option<i64>) = conn
            .query_row(
                "SELECT active, deactivated_at FROM peers WHERE public_key = 'pk1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(!active);
        assert!(deactivated_at.is_some());
    }

    #[test]
    fn test_active_addresses() {
        let store = test_store();
        store
            .insert(&test_peer("pk1", Ipv4Addr::new(10, 8, 0, 2)))
            .unwrap();
        store
            .insert(&test_peer("pk2", Ipv4Addr::new(10, 8, 0, 5)))
            .unwrap();
        store.deactivate("pk1").unwrap();

        let addrs = store.active_addresses().unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs.contains(&Ipv4Addr::new(10, 8, 0, 5)));
    }
}
