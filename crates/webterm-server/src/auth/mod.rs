//! Authentication collaborators consumed by the connection handler.

pub mod origin;
pub mod rate_limit;
pub mod token;

pub use origin::OriginPolicy;
pub use rate_limit::AuthRateLimiter;
pub use token::{generate_token, StaticToken, TokenValidator};
