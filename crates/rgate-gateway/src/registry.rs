//! Device/session registry collaborator.
//!
//! The registry is process-wide shared state that the gateway only reads:
//! it answers whether a session still exists, and yields the per-session
//! secret and upstream forwarding details. A session disappearing from the
//! registry mid-flight is how the gateway learns the device was removed or
//! disconnected out of band.

use std::collections::HashMap;
use std::sync::RwLock;

/// Basic-auth material the device requires for its local service.
#[derive(Debug, Clone)]
pub struct UpstreamAuth {
    pub username: String,
    pub password: String,
}

/// One registered device/session pair.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Identifier of the device this session belongs to.
    pub device_id: String,
    /// Per-session random secret; source of the one-time code and the
    /// session-cookie digest.
    pub secret: Vec<u8>,
    /// Host of the upstream service on the device.
    pub forwarded_host: String,
    /// Port of the upstream service on the device.
    pub forwarded_port: u16,
    /// Credentials to inject when the device requires them.
    pub auth: Option<UpstreamAuth>,
}

/// Read-only view of the device/session registry.
pub trait SessionRegistry: Send + Sync {
    fn exists(&self, session_key: &str) -> bool;
    fn secret(&self, session_key: &str) -> Option<Vec<u8>>;
    fn forwarded_host(&self, session_key: &str) -> Option<String>;
    fn forwarded_port(&self, session_key: &str) -> Option<u16>;
    fn auth_required(&self, session_key: &str) -> bool;
    fn auth(&self, session_key: &str) -> Option<UpstreamAuth>;
}

/// In-memory registry used by the dev binary and tests.
///
/// Writers (the hosting application) insert and remove entries; the gateway
/// goes through the read-only [`SessionRegistry`] view.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_key: impl Into<String>, entry: SessionEntry) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(session_key.into(), entry);
    }

    pub fn remove(&self, session_key: &str) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(session_key);
    }

    fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(session_key)
            .cloned()
    }
}

impl SessionRegistry for MemoryRegistry {
    fn exists(&self, session_key: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(session_key)
    }

    fn secret(&self, session_key: &str) -> Option<Vec<u8>> {
        self.get(session_key).map(|e| e.secret)
    }

    fn forwarded_host(&self, session_key: &str) -> Option<String> {
        self.get(session_key).map(|e| e.forwarded_host)
    }

    fn forwarded_port(&self, session_key: &str) -> Option<u16> {
        self.get(session_key).map(|e| e.forwarded_port)
    }

    fn auth_required(&self, session_key: &str) -> bool {
        self.get(session_key).map(|e| e.auth.is_some()).unwrap_or(false)
    }

    fn auth(&self, session_key: &str) -> Option<UpstreamAuth> {
        self.get(session_key).and_then(|e| e.auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SessionEntry {
        SessionEntry {
            device_id: "dev-1".into(),
            secret: b"secret".to_vec(),
            forwarded_host: "device.local".into(),
            forwarded_port: 8080,
            auth: None,
        }
    }

    #[test]
    fn insert_lookup_remove() {
        let registry = MemoryRegistry::new();
        assert!(!registry.exists("s1"));

        registry.insert("s1", entry());
        assert!(registry.exists("s1"));
        assert_eq!(registry.secret("s1").unwrap(), b"secret");
        assert_eq!(registry.forwarded_host("s1").unwrap(), "device.local");
        assert_eq!(registry.forwarded_port("s1").unwrap(), 8080);
        assert!(!registry.auth_required("s1"));

        registry.remove("s1");
        assert!(!registry.exists("s1"));
        assert!(registry.secret("s1").is_none());
    }

    #[test]
    fn auth_material() {
        let registry = MemoryRegistry::new();
        let mut e = entry();
        e.auth = Some(UpstreamAuth {
            username: "admin".into(),
            password: "hunter2".into(),
        });
        registry.insert("s1", e);

        assert!(registry.auth_required("s1"));
        let auth = registry.auth("s1").unwrap();
        assert_eq!(auth.username, "admin");
        assert_eq!(auth.password, "hunter2");
    }
}
