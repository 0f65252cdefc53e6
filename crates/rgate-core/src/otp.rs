//! Time-based one-time codes for the handshake path.
//!
//! RFC 6238 TOTP over RFC 4226 HOTP: HMAC-SHA1, 6 digits, 30-second step.
//! The code gates the initial secret-path request only; every later request
//! is authenticated by the session cookie (see [`crate::token`]).

use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of one time step in seconds.
pub const STEP_SECS: u64 = 30;

/// Number of decimal digits in a code.
const DIGITS: u32 = 6;

/// Clock-skew tolerance: accept codes from this many adjacent steps.
const SKEW_STEPS: u64 = 1;

/// RFC 4226 HOTP value for a counter.
fn hotp(secret: &[u8], counter: u64) -> u32 {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
    let tag = hmac::sign(&key, &counter.to_be_bytes());
    let digest = tag.as_ref();

    // Dynamic truncation (RFC 4226 §5.3).
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] & 0x7f) as u32) << 24
        | (digest[offset + 1] as u32) << 16
        | (digest[offset + 2] as u32) << 8
        | (digest[offset + 3] as u32);

    binary % 10u32.pow(DIGITS)
}

/// Compute the code for a given Unix time.
pub fn code_at(secret: &[u8], unix_secs: u64) -> String {
    format!("{:06}", hotp(secret, unix_secs / STEP_SECS))
}

/// Compute the code for the current time step.
pub fn current_code(secret: &[u8]) -> String {
    code_at(secret, now_secs())
}

/// Verify a caller-supplied code at a given Unix time.
///
/// Accepts the current step plus `SKEW_STEPS` steps on either side, the
/// standard clock-skew allowance.
pub fn verify_at(secret: &[u8], code: &str, unix_secs: u64) -> bool {
    let step = unix_secs / STEP_SECS;
    let low = step.saturating_sub(SKEW_STEPS);
    (low..=step + SKEW_STEPS).any(|s| format!("{:06}", hotp(secret, s)) == code)
}

/// Verify a caller-supplied code against the current time.
pub fn verify(secret: &[u8], code: &str) -> bool {
    verify_at(secret, code, now_secs())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test secret (ASCII "12345678901234567890").
    const SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn rfc_vectors() {
        // T = 59 → counter 1 → HOTP 287082 (low 6 digits of the RFC value).
        assert_eq!(code_at(SECRET, 59), "287082");
        // T = 29 → counter 0 → 755224 (RFC 4226 appendix D, count 0).
        assert_eq!(code_at(SECRET, 29), "755224");
    }

    #[test]
    fn verify_current_step() {
        let code = code_at(SECRET, 1_000_000);
        assert!(verify_at(SECRET, &code, 1_000_000));
    }

    #[test]
    fn verify_adjacent_steps() {
        let t = 1_000_000;
        let previous = code_at(SECRET, t - STEP_SECS);
        let next = code_at(SECRET, t + STEP_SECS);
        assert!(verify_at(SECRET, &previous, t));
        assert!(verify_at(SECRET, &next, t));
    }

    #[test]
    fn reject_outside_window() {
        let t = 1_000_000;
        let stale = code_at(SECRET, t - 2 * STEP_SECS);
        assert!(!verify_at(SECRET, &stale, t));
    }

    #[test]
    fn reject_garbage() {
        assert!(!verify_at(SECRET, "000000", 59));
        assert!(!verify_at(SECRET, "", 59));
        assert!(!verify_at(SECRET, "28708", 59));
    }
}
