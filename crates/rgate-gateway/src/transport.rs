//! Tunnel transport collaborator.
//!
//! The transport owns the secure channel to the device. The gateway asks it
//! for duplex byte streams (one per bridged connection), registers itself as
//! the active gateway for its session, and subscribes to the process-wide
//! event bus to learn about `kill` signals targeting its device.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A duplex byte stream to the remote device.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Events published on the transport's process-wide bus.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The device's tunnel is gone; any gateway for it must stop.
    Kill { device_id: String },
}

/// Registration record for an active gateway, so other components can see
/// which session is currently proxied and where.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    pub device_id: String,
    pub public_port: u16,
}

/// Interface the gateway uses to reach the tunnel layer.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Obtain a fresh duplex stream to the device behind `session_key`.
    ///
    /// `None` means the device is currently unreachable; the caller closes
    /// its side immediately.
    async fn open_stream(&self, session_key: &str) -> Option<Box<dyn TunnelStream>>;

    /// Subscribe to the process-wide event bus.
    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent>;

    /// Register (`Some`) or clear (`None`) the active gateway for a session.
    fn proxy_active(&self, session_key: &str, handle: Option<GatewayHandle>);
}

/// Development transport: "tunnels" by connecting directly to a TCP target.
///
/// Stands in for the production stream provider so the gateway can be run
/// and tested against any local service.
pub struct TcpTransport {
    target_host: String,
    target_port: u16,
    events: broadcast::Sender<TunnelEvent>,
    active: RwLock<HashMap<String, GatewayHandle>>,
}

impl TcpTransport {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            target_host: target_host.into(),
            target_port,
            events,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a kill signal for a device.
    pub fn kill(&self, device_id: impl Into<String>) {
        let _ = self.events.send(TunnelEvent::Kill {
            device_id: device_id.into(),
        });
    }

    /// The handle registered for a session, if any.
    pub fn active_handle(&self, session_key: &str) -> Option<GatewayHandle> {
        self.active
            .read()
            .expect("transport lock poisoned")
            .get(session_key)
            .cloned()
    }
}

#[async_trait]
impl TunnelTransport for TcpTransport {
    async fn open_stream(&self, session_key: &str) -> Option<Box<dyn TunnelStream>> {
        match TcpStream::connect((self.target_host.as_str(), self.target_port)).await {
            Ok(stream) => {
                debug!(session = %session_key, "tunnel stream opened");
                Some(Box::new(stream))
            }
            Err(e) => {
                warn!(session = %session_key, error = %e, "tunnel target unreachable");
                None
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    fn proxy_active(&self, session_key: &str, handle: Option<GatewayHandle>) {
        let mut active = self.active.write().expect("transport lock poisoned");
        match handle {
            Some(h) => {
                debug!(session = %session_key, port = h.public_port, "gateway registered");
                active.insert(session_key.to_string(), h);
            }
            None => {
                debug!(session = %session_key, "gateway unregistered");
                active.remove(session_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_stream_unreachable_returns_none() {
        // Port 1 on loopback is never listening in test environments.
        let transport = TcpTransport::new("127.0.0.1", 1);
        assert!(transport.open_stream("s1").await.is_none());
    }

    #[tokio::test]
    async fn registration_roundtrip() {
        let transport = TcpTransport::new("127.0.0.1", 1);
        transport.proxy_active(
            "s1",
            Some(GatewayHandle {
                device_id: "dev-1".into(),
                public_port: 42001,
            }),
        );
        assert_eq!(transport.active_handle("s1").unwrap().public_port, 42001);

        transport.proxy_active("s1", None);
        assert!(transport.active_handle("s1").is_none());
    }

    #[tokio::test]
    async fn kill_reaches_subscribers() {
        let transport = TcpTransport::new("127.0.0.1", 1);
        let mut rx = transport.subscribe();
        transport.kill("dev-1");
        match rx.recv().await.unwrap() {
            TunnelEvent::Kill { device_id } => assert_eq!(device_id, "dev-1"),
        }
    }
}
