//! Credential records and the pluggable auth store.
//!
//! The gate never owns the storage medium: it reads credentials through
//! [`AuthStore::get_credential`] and writes updates through
//! [`AuthStore::set_credential`]. Persistence writes happen only on refresh
//! token rotation, project resolution, and revocation, never on an unchanged
//! record, to avoid write amplification on a shared storage layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::constants::EXPIRY_SAFETY_MARGIN_SECS;
use crate::error::Result;

/// A stored credential for one provider identity.
///
/// The refresh token is the stable identity key; everything else is derived
/// state that gets rewritten over the credential's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Opaque long-lived refresh token. Empty means "needs re-login".
    pub refresh_token: String,

    /// Short-lived access token, if one has been issued.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Unix timestamp when the access token expires.
    #[serde(default)]
    pub expires_at: Option<i64>,

    /// Explicitly configured project id.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Backend-assigned managed project id, discovered via onboarding.
    #[serde(default)]
    pub managed_project_id: Option<String>,
}

impl CredentialRecord {
    /// Create a record holding only a refresh token.
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            access_token: None,
            expires_at: None,
            project_id: None,
            managed_project_id: None,
        }
    }

    /// Whether the access token can be trusted.
    ///
    /// True only when a token is present and its expiry is more than the
    /// safety margin (60 s) in the future.
    #[must_use]
    pub fn has_valid_access_token(&self) -> bool {
        if self.access_token.as_deref().unwrap_or("").is_empty() {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > chrono::Utc::now().timestamp() + EXPIRY_SAFETY_MARGIN_SECS,
            None => false,
        }
    }

    /// Update the access token and expiry while preserving other fields.
    pub fn with_access_token(mut self, access_token: String, expires_in: i64) -> Self {
        self.access_token = Some(access_token);
        self.expires_at = Some(chrono::Utc::now().timestamp() + expires_in);
        self
    }

    /// A revoked copy of this record: refresh token emptied so the caller
    /// can detect "needs re-login".
    pub fn revoked(&self) -> Self {
        Self {
            refresh_token: String::new(),
            access_token: None,
            expires_at: None,
            project_id: self.project_id.clone(),
            managed_project_id: None,
        }
    }
}

/// Pluggable credential persistence, keyed by provider identity.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Load the stored credential, if any.
    async fn get_credential(&self) -> Result<Option<CredentialRecord>>;

    /// Persist an updated credential.
    async fn set_credential(&self, record: &CredentialRecord) -> Result<()>;
}

/// In-memory auth store.
///
/// Thread-safe and `Clone`; clones share state. Useful for tests and
/// short-lived callers that don't need persistence.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthStore {
    inner: Arc<RwLock<Option<CredentialRecord>>>,
}

impl MemoryAuthStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a credential.
    pub fn with_credential(record: CredentialRecord) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(record))),
        }
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn get_credential(&self) -> Result<Option<CredentialRecord>> {
        Ok(self.inner.read().await.clone())
    }

    async fn set_credential(&self, record: &CredentialRecord) -> Result<()> {
        let mut guard = self.inner.write().await;
        *guard = Some(record.clone());
        Ok(())
    }
}

/// Mask a token for safe logging.
///
/// Shows the first and last 4 characters, masks the rest.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 12 {
        return "***".to_string();
    }
    format!("{}***{}", &token[..4], &token[token.len() - 4..])
}
