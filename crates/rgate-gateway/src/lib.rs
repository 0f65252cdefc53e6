//! rgate-gateway: ephemeral reverse-proxy gateway for firewalled devices.
//!
//! One gateway instance makes a single remote device's local web service
//! reachable through a public origin for the duration of a session:
//!
//! - **[`allocator`]** — picks a random available public port inside a
//!   configured range.
//! - **[`bridge`]** — a loopback TCP listener whose accepted connections are
//!   spliced onto duplex tunnel streams obtained from the transport
//!   collaborator.
//! - **[`rewrite`]** — rewrites proxied HTML bodies, `Location` headers, and
//!   `Set-Cookie` scoping so every URL keeps routing through the gateway.
//! - **[`session`]** — the orchestrator: owns both listeners, gates access
//!   with a one-time code followed by a signed-cookie session, and proxies
//!   all other traffic to the bridge.
//!
//! The device/session registry ([`registry`]) and the tunnel transport
//! ([`transport`]) are external collaborators: the gateway reads from and
//! subscribes to them but never owns their lifecycle.

pub mod allocator;
pub mod bridge;
pub mod config;
pub mod pages;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod session;
pub mod transport;

pub use config::GatewayConfig;
pub use pages::{BasicPages, ErrorPageRenderer};
pub use registry::{MemoryRegistry, SessionEntry, SessionRegistry, UpstreamAuth};
pub use session::{Endpoints, GatewaySession, SessionState};
pub use transport::{GatewayHandle, TcpTransport, TunnelEvent, TunnelStream, TunnelTransport};
