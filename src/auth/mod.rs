//! OAuth authentication: PKCE login flow and token refresh.

pub mod oauth;
pub mod pkce;
pub mod refresh;

pub use oauth::{build_authorize_url, exchange_code, CodeReplayGuard};
pub use pkce::Pkce;
pub use refresh::RefreshCoordinator;
