//! Durable key-value storage for the persisted session.
//!
//! - `FileStore`: one JSON file per key in the cache directory
//! - `KeyringStore`: OS keychain entries
//! - `MemoryStore`: process-local map, for tests and ephemeral use

pub mod file;
pub mod keychain;
pub mod memory;

use anyhow::Result;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;

/// A get/set/remove store of string values.
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}
