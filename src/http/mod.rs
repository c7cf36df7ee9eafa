//! HTTP adapter putting the gate in front of admin routes.

mod middleware;
mod response;
mod server;

pub use middleware::{admin_rate_limit, rate_limit_status, resolve_api_key_header, ApiKeyId, API_KEY_ID_HEADER};
pub use response::stamp_headers;
pub use server::{router, GateServer};
