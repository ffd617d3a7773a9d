//! Gate configuration.
//!
//! [`GateConfig`] carries everything the pipeline needs that is not
//! credential state: OAuth client settings, the backend endpoint, the
//! public-surface host used for detection, an optional explicit project
//! override, and retry tuning. All fields have defaults so an empty TOML
//! file (or `GateConfig::default()`) produces a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CAPACITY_COOLDOWN, CODE_ASSIST_ENDPOINT, DEFAULT_AUTH_URL, DEFAULT_CLIENT_ID,
    DEFAULT_CLIENT_SECRET, DEFAULT_SCOPES, DEFAULT_TOKEN_URL, PUBLIC_API_HOST,
};
use crate::error::{Error, Result};

/// OAuth client settings for the authorization server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret (public, installed-app flow).
    pub client_secret: String,
    /// Authorization URL for the interactive flow.
    pub auth_url: String,
    /// Token endpoint URL (code exchange and refresh grant).
    pub token_url: String,
    /// Redirect URI handed to the authorization server.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: DEFAULT_CLIENT_SECRET.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            redirect_uri: "http://localhost:8085/oauth2callback".to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Configuration for a [`CodeAssistGate`](crate::CodeAssistGate) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// OAuth client settings.
    pub oauth: OAuthSettings,

    /// Code Assist backend endpoint base URL.
    pub endpoint: String,

    /// Host of the public API surface whose calls get rewritten.
    pub public_host: String,

    /// Explicitly configured cloud project id, if any.
    ///
    /// Takes precedence over any managed project discovered via onboarding.
    pub project_id: Option<String>,

    /// Standing cooldown applied after a capacity incident with no retry
    /// hint, in milliseconds.
    pub capacity_cooldown_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            oauth: OAuthSettings::default(),
            endpoint: CODE_ASSIST_ENDPOINT.to_string(),
            public_host: PUBLIC_API_HOST.to_string(),
            project_id: None,
            capacity_cooldown_ms: CAPACITY_COOLDOWN.as_millis() as u64,
        }
    }
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("cannot read config file: {}", e)))?;
        toml::from_str(&raw).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Set the backend endpoint (useful for testing).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the public-surface host used for detection (useful for testing).
    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = host.into();
        self
    }

    /// Set an explicit project id override.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the token endpoint URL (useful for testing).
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.oauth.token_url = url.into();
        self
    }

    /// The capacity cooldown as a [`Duration`].
    pub fn capacity_cooldown(&self) -> Duration {
        Duration::from_millis(self.capacity_cooldown_ms)
    }
}
