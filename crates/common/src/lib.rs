//! testrig common library
//!
//! Shared types, the line protocol codec, result stores and the tool output
//! parsers used by the testrig daemon.

pub mod db;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use db::SqliteStore;
pub use error::{Error, Result};
pub use store::{MemoryStore, ResultStore};
pub use types::*;

/// testrig version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".testrig")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
