//! Request and response translation between the public and internal surfaces.

pub mod enhance;
pub mod request;
pub mod response;
pub mod schema;
pub mod stream;
pub mod thinking;

pub use request::{detect_target, prepare, PreparedRequest, TargetAction};
pub use response::{unwrap_buffered, unwrap_payload, usage_headers};
pub use stream::SseRewriteStream;
