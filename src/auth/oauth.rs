//! Authorization-code + PKCE exchange against Google's token endpoint.
//!
//! The interactive half of the flow (opening a browser, the loopback
//! listener catching the redirect) is an external collaborator; this module
//! only builds the authorize URL and performs the code exchange that mints
//! the initial [`CredentialRecord`].
//!
//! # Replay protection
//!
//! A (code, verifier) pair that already completed a successful exchange is
//! rejected with [`Error::CodeAlreadyUsed`] on any later submission, so a
//! duplicated redirect cannot silently clobber a fresh credential.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::OAuthSettings;
use crate::credentials::CredentialRecord;
use crate::error::{Error, Result};

use super::pkce::Pkce;

/// Build the authorization URL for the interactive consent flow.
///
/// Google requires `access_type=offline` and `prompt=consent` to guarantee
/// a refresh token is returned.
pub fn build_authorize_url(oauth: &OAuthSettings, pkce: &Pkce, state: &str) -> String {
    let scopes = oauth.scopes.join(" ");
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&code_challenge={}&code_challenge_method=S256&state={}&access_type=offline&prompt=consent",
        oauth.auth_url,
        urlencoding::encode(&oauth.client_id),
        urlencoding::encode(&oauth.redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(&pkce.challenge),
        urlencoding::encode(state),
    )
}

/// Success response from the token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    #[serde(default)]
    pub(crate) refresh_token: Option<String>,
    pub(crate) expires_in: i64,
}

/// Error response from the token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorResponse {
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

/// Tracks (code, verifier) pairs that have completed a successful exchange.
#[derive(Debug, Default)]
pub struct CodeReplayGuard {
    used: Mutex<HashSet<[u8; 32]>>,
}

impl CodeReplayGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(code: &str, verifier: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        hasher.update(b"\0");
        hasher.update(verifier.as_bytes());
        hasher.finalize().into()
    }

    /// Whether this pair already completed a successful exchange.
    pub fn is_used(&self, code: &str, verifier: &str) -> bool {
        let fp = Self::fingerprint(code, verifier);
        self.used.lock().map(|set| set.contains(&fp)).unwrap_or(false)
    }

    /// Record a successful exchange.
    fn mark_used(&self, code: &str, verifier: &str) {
        let fp = Self::fingerprint(code, verifier);
        if let Ok(mut set) = self.used.lock() {
            set.insert(fp);
        }
    }
}

/// Exchange an authorization code for an initial credential record.
///
/// Fails with [`Error::CodeAlreadyUsed`] when the same (code, verifier)
/// pair is replayed after a prior success.
pub async fn exchange_code(
    http: &reqwest::Client,
    oauth: &OAuthSettings,
    guard: &CodeReplayGuard,
    code: &str,
    verifier: &str,
) -> Result<CredentialRecord> {
    if guard.is_used(code, verifier) {
        return Err(Error::CodeAlreadyUsed);
    }

    debug!("exchanging authorization code");

    let form = [
        ("code", code),
        ("code_verifier", verifier),
        ("grant_type", "authorization_code"),
        ("redirect_uri", oauth.redirect_uri.as_str()),
        ("client_id", oauth.client_id.as_str()),
        ("client_secret", oauth.client_secret.as_str()),
    ];

    let response = http.post(&oauth.token_url).form(&form).send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body) {
            warn!(error = %err.error, description = ?err.error_description, "code exchange failed");
            return Err(Error::ExchangeFailed(
                err.error_description.unwrap_or(err.error),
            ));
        }
        return Err(Error::ExchangeFailed(format!(
            "HTTP {}: {}",
            status.as_u16(),
            body
        )));
    }

    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| Error::ExchangeFailed(format!("malformed token response: {}", e)))?;

    let refresh_token = token.refresh_token.ok_or_else(|| {
        Error::ExchangeFailed(
            "no refresh token in response; ensure access_type=offline and prompt=consent".into(),
        )
    })?;

    guard.mark_used(code, verifier);
    debug!("code exchange successful");

    Ok(CredentialRecord::new(refresh_token)
        .with_access_token(token.access_token, token.expires_in))
}
