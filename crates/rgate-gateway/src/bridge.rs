//! Tunnel bridge: loopback listener spliced onto tunnel streams.
//!
//! Binds an ephemeral port on `127.0.0.1` only — the local tunnel port is
//! never exposed outside the host. Each accepted connection gets its own
//! duplex stream from the transport and a plain bidirectional relay: this
//! path carries raw, possibly non-HTTP, bytes for whatever protocols the
//! device serves.

use crate::transport::TunnelTransport;
use rgate_core::{GateError, GateResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// The loopback listener plus its live-connection registry.
pub struct TunnelBridge {
    /// Ephemeral port the bridge listens on.
    local_port: u16,
    /// Live connections: connection id to close-signal sender.
    conns: Arc<Mutex<HashMap<u64, mpsc::Sender<()>>>>,
    /// Cancel sender for the accept loop.
    cancel_tx: mpsc::Sender<()>,
}

impl TunnelBridge {
    /// Bind the bridge and spawn its accept loop.
    ///
    /// `grace` bounds how long a connection may linger after a close signal
    /// before it is torn down. Listener runtime errors are reported through
    /// `fatal_tx` so the owning session can stop.
    pub async fn bind(
        transport: Arc<dyn TunnelTransport>,
        session_key: String,
        grace: Duration,
        fatal_tx: mpsc::Sender<GateError>,
    ) -> GateResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| GateError::Bind(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| GateError::Bind(e.to_string()))?
            .port();

        let conns = Arc::new(Mutex::new(HashMap::new()));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        tokio::spawn(accept_loop(
            listener,
            transport,
            session_key,
            conns.clone(),
            cancel_rx,
            grace,
            fatal_tx,
        ));

        info!(local_port, "tunnel bridge listening");

        Ok(Self {
            local_port,
            conns,
            cancel_tx,
        })
    }

    /// Port the bridge is listening on (loopback only).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Number of live tunnel connections.
    pub async fn live_connections(&self) -> usize {
        self.conns.lock().await.len()
    }

    /// Stop accepting and close every live connection.
    ///
    /// Each relay gets a close signal; a relay that has not finished within
    /// the grace period is torn down by dropping its sockets.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(()).await;
        let senders: Vec<mpsc::Sender<()>> =
            self.conns.lock().await.values().cloned().collect();
        for tx in senders {
            let _ = tx.send(()).await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<dyn TunnelTransport>,
    session_key: String,
    conns: Arc<Mutex<HashMap<u64, mpsc::Sender<()>>>>,
    mut cancel_rx: mpsc::Receiver<()>,
    grace: Duration,
    fatal_tx: mpsc::Sender<GateError>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("bridge accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, _peer)) => {
                        // Fresh random identifier per connection.
                        let conn_id: u64 = rand::random();

                        let (close_tx, close_rx) = mpsc::channel::<()>(1);
                        conns.lock().await.insert(conn_id, close_tx);

                        tokio::spawn(relay(
                            conn_id,
                            socket,
                            transport.clone(),
                            session_key.clone(),
                            conns.clone(),
                            close_rx,
                            grace,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "bridge accept failed");
                        let _ = fatal_tx.send(GateError::Listener(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Splice one accepted connection onto one tunnel stream.
///
/// Deregistration happens exactly once, here, regardless of which side
/// closed first.
async fn relay(
    conn_id: u64,
    mut socket: TcpStream,
    transport: Arc<dyn TunnelTransport>,
    session_key: String,
    conns: Arc<Mutex<HashMap<u64, mpsc::Sender<()>>>>,
    mut close_rx: mpsc::Receiver<()>,
    grace: Duration,
) {
    let Some(stream) = transport.open_stream(&session_key).await else {
        warn!(conn_id, "no tunnel stream available, closing connection");
        conns.lock().await.remove(&conn_id);
        return;
    };

    debug!(conn_id, "tunnel connection spliced");

    let (mut sock_rd, mut sock_wr) = socket.split();
    let (mut tun_rd, mut tun_wr) = tokio::io::split(stream);

    // Two independent copy directions: whichever side closes first starts
    // the grace period for the other before the forced teardown.
    let up = async {
        let result = tokio::io::copy(&mut sock_rd, &mut tun_wr).await;
        let _ = tun_wr.shutdown().await;
        result
    };
    let down = async {
        let result = tokio::io::copy(&mut tun_rd, &mut sock_wr).await;
        let _ = sock_wr.shutdown().await;
        result
    };
    tokio::pin!(up);
    tokio::pin!(down);

    tokio::select! {
        _ = &mut up => {
            if tokio::time::timeout(grace, &mut down).await.is_err() {
                debug!(conn_id, "grace period elapsed, forcing close");
            }
        }
        _ = &mut down => {
            if tokio::time::timeout(grace, &mut up).await.is_err() {
                debug!(conn_id, "grace period elapsed, forcing close");
            }
        }
        _ = close_rx.recv() => {
            let drain = async {
                let _ = tokio::join!(&mut up, &mut down);
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                debug!(conn_id, "grace period elapsed, forcing close");
            }
        }
    }

    conns.lock().await.remove(&conn_id);
    debug!(conn_id, "tunnel connection closed");
}
