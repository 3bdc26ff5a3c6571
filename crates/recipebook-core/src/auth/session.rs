use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Storage key the persisted session lives under.
pub const SESSION_KEY: &str = "userData";

/// An authenticated identity and its bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub email: String,
    pub user_id: String,
    token: String,
    pub token_expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        email: impl Into<String>,
        user_id: impl Into<String>,
        token: impl Into<String>,
        token_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            email: email.into(),
            user_id: user_id.into(),
            token: token.into(),
            token_expires_at,
        }
    }

    /// The bearer token, or `None` once it has expired.
    pub fn token(&self) -> Option<&str> {
        if self.is_valid() {
            Some(&self.token)
        } else {
            None
        }
    }

    /// True while the token is non-empty and its expiry is strictly in the future.
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty() && self.token_expires_at > Utc::now()
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.token_expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

/// Serialized form of a [`Session`].
///
/// Field names match what earlier web clients wrote, so a stored session
/// survives switching between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub email: String,
    pub id: String,
    #[serde(rename = "_token")]
    pub token: String,
    #[serde(rename = "_tokenExpirationDate")]
    pub token_expiration_date: DateTime<Utc>,
}

impl From<&Session> for PersistedSession {
    fn from(session: &Session) -> Self {
        Self {
            email: session.email.clone(),
            id: session.user_id.clone(),
            token: session.token.clone(),
            token_expiration_date: session.token_expires_at,
        }
    }
}

impl From<PersistedSession> for Session {
    fn from(persisted: PersistedSession) -> Self {
        Session::new(
            persisted.email,
            persisted.id,
            persisted.token,
            persisted.token_expiration_date,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
