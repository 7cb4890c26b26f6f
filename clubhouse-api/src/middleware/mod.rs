pub mod auth;
pub mod rate_limit;

pub use auth::{require_auth, require_operator, Claims};
pub use rate_limit::rate_limit_middleware;
