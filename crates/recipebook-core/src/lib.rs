//! Core library for recipebook account sessions.
//!
//! - `api`: credential exchange with the identity provider
//! - `auth`: the session model and its lifecycle manager
//! - `storage`: key-value backends used to persist the session
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod storage;

pub use api::{
    AuthClient, AuthError, IdentityTransport, Locale, ProviderErrorCode, ReqwestTransport,
};
pub use auth::{Navigator, NoopNavigator, PersistedSession, Session, SessionManager, SessionState};
pub use config::{Config, StorageBackend};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
