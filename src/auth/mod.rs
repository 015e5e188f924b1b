//! Service-to-service authentication
//!
//! Handles:
//! - Issuing and verifying inter-service trust tokens
//! - Guarding the internal surface

mod middleware;
pub mod service_token;

pub use middleware::require_service_token;
pub use service_token::{ServiceClaims, authenticate, issue_token, verify_token};
