//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `Session`: the authenticated identity and its bearer token
//! - `SessionManager`: owns the current session, persists it, expires it
//!   when the provider-declared lifetime elapses and publishes every change
//!
//! The session is persisted under a single well-known key and restored
//! once at startup.

pub mod manager;
pub mod session;

pub use manager::{Navigator, NoopNavigator, SessionManager, SessionState};
pub use session::{PersistedSession, Session, SESSION_KEY};
