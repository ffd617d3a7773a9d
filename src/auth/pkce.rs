//! PKCE (Proof Key for Code Exchange) challenge generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE S256 verifier/challenge pair.
#[derive(Debug, Clone)]
pub struct Pkce {
    /// The code verifier, sent with the token request.
    pub verifier: String,
    /// The S256 challenge derived from the verifier, sent with the
    /// authorization request.
    pub challenge: String,
}

impl Pkce {
    /// Generate a fresh verifier and its S256 challenge.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let verifier_bytes: Vec<u8> = (0..32).map(|_| rng.random::<u8>()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&verifier_bytes);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}
