//! Credential exchange with the identity provider.
//!
//! `AuthClient` signs users up or in with email and password, hands a
//! successful result to the `SessionManager`, and turns every failure into
//! an `AuthError` with a user-facing message.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth::{Session, SessionManager};
use crate::config::Config;

use super::{AuthError, IdentityTransport, Locale};

// ============================================================================
// Constants
// ============================================================================

/// Base URL of the identity provider's account endpoints
pub const DEFAULT_ENDPOINT: &str = "https://identitytoolkit.googleapis.com/v1/accounts";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    id_token: String,
    email: String,
    /// Token lifetime in seconds, sent as a string.
    expires_in: String,
    local_id: String,
    registered: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    SignUp,
    LogIn,
}

impl Exchange {
    fn method(self) -> &'static str {
        match self {
            Exchange::SignUp => "signUp",
            Exchange::LogIn => "signInWithPassword",
        }
    }
}

/// Client for the identity provider's email/password endpoints.
#[derive(Clone)]
pub struct AuthClient {
    transport: Arc<dyn IdentityTransport>,
    sessions: SessionManager,
    endpoint: String,
    api_key: String,
    locale: Locale,
}

impl AuthClient {
    pub fn new(
        transport: Arc<dyn IdentityTransport>,
        sessions: SessionManager,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            sessions,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            locale: Locale::default(),
        }
    }

    /// Build a client from configuration. Fails when no API key is configured.
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn IdentityTransport>,
        sessions: SessionManager,
    ) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow!("No API key configured"))?;

        let mut client = Self::new(transport, sessions, api_key).with_locale(config.locale);
        if let Some(ref endpoint) = config.endpoint {
            client = client.with_endpoint(endpoint.clone());
        }
        Ok(client)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    /// The session manager successful exchanges are handed to.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Create an account and start a session for it.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.exchange(Exchange::SignUp, email, password).await
    }

    /// Sign in with an existing account and start a session for it.
    pub async fn log_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.exchange(Exchange::LogIn, email, password).await
    }

    /// Send exactly one request; failures are returned, never retried.
    async fn exchange(
        &self,
        kind: Exchange,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let url = format!(
            "{}:{}?key={}",
            self.endpoint.trim_end_matches('/'),
            kind.method(),
            self.api_key
        );
        let body = json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });

        debug!(?kind, "Sending credential exchange");
        let response = self.transport.post_json(&url, &body).await.map_err(|e| {
            warn!(?kind, error = %e, "Credential exchange failed");
            AuthError::transport(self.locale, format!("{:#}", e))
        })?;

        if !response.is_success() {
            let err =
                AuthError::from_provider_response(self.locale, response.status, &response.body);
            warn!(?kind, status = response.status, error = ?err, "Credential exchange rejected");
            return Err(err);
        }

        let auth: AuthResponse = serde_json::from_str(&response.body).map_err(|e| {
            warn!(?kind, error = %e, "Failed to parse credential exchange response");
            AuthError::from_provider_response(self.locale, response.status, &response.body)
        })?;

        let ttl_secs: u64 = auth.expires_in.trim().parse().map_err(|_| {
            warn!(?kind, expires_in = %auth.expires_in, "Invalid token lifetime");
            AuthError::transport(
                self.locale,
                format!("Invalid expiresIn: {}", auth.expires_in),
            )
        })?;

        info!(?kind, registered = ?auth.registered, ttl_secs, "Credential exchange succeeded");
        Ok(self
            .sessions
            .establish(&auth.email, &auth.local_id, &auth.id_token, ttl_secs))
    }
}

// ============================================================================
// Tests
// ============================================================================
