//! Public-port allocation.
//!
//! Draws uniformly random candidates from the configured range and tries to
//! bind each one. Any bind error counts as a failed attempt — treating
//! "port in use" and transient OS errors alike keeps the allocator resilient
//! while the attempt cap bounds worst-case startup latency.

use rand::Rng;
use rgate_core::{GateError, GateResult};
use tokio::net::TcpListener;
use tracing::debug;

/// Maximum bind attempts before giving up. Fatal, non-retryable by callers.
pub const MAX_ATTEMPTS: u32 = 10_000;

/// Bind a listener on `host` to a random free port in `[low, high]`.
pub async fn bind_public(host: &str, low: u16, high: u16) -> GateResult<TcpListener> {
    if low > high {
        return Err(GateError::Config(format!("invalid port range {low}-{high}")));
    }

    for attempt in 1..=MAX_ATTEMPTS {
        let port = rand::thread_rng().gen_range(low..=high);
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                debug!(port, attempt, "public port bound");
                return Ok(listener);
            }
            Err(_) => continue,
        }
    }

    Err(GateError::PortExhausted(MAX_ATTEMPTS))
}
