//! Identity provider client module.
//!
//! This module provides the `AuthClient` for exchanging email/password
//! credentials with the identity provider, and the error taxonomy that
//! provider failures are translated into.
//!
//! The network transport is injected through `IdentityTransport`;
//! `ReqwestTransport` is the production implementation.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{AuthClient, DEFAULT_ENDPOINT};
pub use error::{AuthError, Locale, ProviderErrorCode};
pub use transport::{IdentityTransport, ReqwestTransport, TransportResponse};
