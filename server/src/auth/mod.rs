//! Caller identity.

mod middleware;

pub use middleware::{authenticate, authenticate_headers, AuthUser};
