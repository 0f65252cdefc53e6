//! Session-cookie material.
//!
//! After a successful one-time-code handshake the browser is issued a
//! long-lived cookie whose value is a one-way digest of the per-session
//! secret. Every later request must present the exact digest; the secret
//! itself never leaves the server.

use sha2::{Digest, Sha256};

/// Derive the session-cookie value from the per-session secret.
///
/// Deterministic, so the gateway can recompute it on every request instead
/// of storing issued cookies.
pub fn cookie_digest(secret: &[u8]) -> String {
    hex::encode(Sha256::digest(secret))
}

/// Generate a random per-session secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let secret = generate_secret();
        assert_eq!(cookie_digest(&secret), cookie_digest(&secret));
    }

    #[test]
    fn digest_is_hex_sha256() {
        let digest = cookie_digest(b"abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn different_secrets_differ() {
        assert_ne!(
            cookie_digest(&generate_secret()),
            cookie_digest(&generate_secret())
        );
    }
}
