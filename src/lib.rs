//! Request/response translation layer for Google's Code Assist backend.
//!
//! OAuth-authenticated accounts cannot call the public generative-language
//! API directly; their calls must go to the internal Code Assist surface,
//! which speaks a different envelope, a different error dialect, and its own
//! quota regime. This crate intercepts outbound calls, rewrites the matching
//! ones, and hands everything else through untouched:
//!
//! - [`auth`] keeps the access token fresh, coalescing concurrent refreshes
//!   and handling refresh-token rotation and revocation.
//! - [`project`] resolves the cloud project a call is billed to, onboarding
//!   free-tier accounts onto a managed project when needed.
//! - [`transform`] rewrites request bodies into the internal envelope and
//!   unwraps responses (buffered or streaming) back into the public shape.
//! - [`retry`] bounds retries, classifies quota failures, and carries
//!   standing cooldowns per (endpoint, project, model).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use codeassist_gate::{CodeAssistGate, GateConfig, MemoryAuthStore, OutboundCall};
//!
//! # async fn run() -> codeassist_gate::Result<()> {
//! let gate = CodeAssistGate::activate(GateConfig::default(), Arc::new(MemoryAuthStore::new()))?;
//! let call = OutboundCall::post(
//!     "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent",
//!     r#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#,
//! );
//! let response = gate.fetch(call).await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod project;
pub mod retry;
pub mod transform;

pub use auth::{CodeReplayGuard, Pkce, RefreshCoordinator};
pub use config::{GateConfig, OAuthSettings};
pub use credentials::{AuthStore, CredentialRecord, MemoryAuthStore};
pub use error::{Error, Result};
pub use gate::{CodeAssistGate, GateResponse, OutboundCall, ResponseBody};
pub use project::ProjectResolver;
pub use retry::{CooldownMap, RetryEngine, ThrottleKey};
