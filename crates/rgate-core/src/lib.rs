//! rgate-core: Shared library for the rgate reverse-proxy gateway.
//!
//! Provides the project-wide error type, RFC 6238 one-time codes for the
//! handshake path, and the digest-based session cookie material.

pub mod error;
pub mod otp;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{GateError, GateResult};
pub use otp::{code_at, current_code, verify, verify_at, STEP_SECS};
pub use token::{cookie_digest, generate_secret};
