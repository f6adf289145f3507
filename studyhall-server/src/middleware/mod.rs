pub mod auth;
pub mod request_context;

pub use auth::require_identity;
pub use request_context::{RequestContext, RequestIdState, assign_request_id};
