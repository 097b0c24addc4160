//! Session Credentials
//!
//! Short-lived secrets handed out by the broker: a REST access token and a
//! real-time approval key. Values are redacted from debug output.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// REST API bearer token.
    AccessToken,
    /// WebSocket approval key.
    ApprovalKey,
}

impl CredentialKind {
    /// Stable identifier for logs, metrics and cache file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::ApprovalKey => "approval_key",
        }
    }
}

/// A credential value with its expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential.
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Secret value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expiry instant.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the credential is still usable at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.value.is_empty() && now < self.expires_at
    }

    /// Whether the credential is still usable.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
