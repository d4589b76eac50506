//! wgrelay common library
//!
//! Shared infrastructure for the wgrelay relay daemon: error taxonomy,
//! SQLite state database, and WireGuard key generation.

pub mod db;
pub mod error;
pub mod keys;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use keys::{generate_keypair, validate_public_key, WgKeyPair};

/// wgrelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgrelay")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("peers.db")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
