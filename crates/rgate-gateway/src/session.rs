//! Gateway session orchestration.
//!
//! One [`GatewaySession`] owns the full lifecycle of one device/session
//! pair: it binds the tunnel bridge, allocates and binds the public
//! listener, wires the credential gate and response rewriter into the
//! request path, and tears everything down on `stop`, on a matching kill
//! event, or when the registry entry disappears.
//!
//! State machine: `idle → starting → running → stopping → stopped`.
//! `start` is memoized: concurrent callers share the same in-flight
//! outcome, and repeated calls after success are no-ops.

use crate::allocator;
use crate::bridge::TunnelBridge;
use crate::config::GatewayConfig;
use crate::pages::ErrorPageRenderer;
use crate::proxy::{self, UpstreamTarget};
use crate::registry::SessionRegistry;
use crate::rewrite::ResponseRewriter;
use crate::transport::{GatewayHandle, TunnelEvent, TunnelTransport};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{COOKIE, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rgate_core::{otp, token, GateError, GateResult};
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex, OnceCell};
use tracing::{debug, error, info, warn};

/// Session cookie lifetime: one year, matching the "issued once, never
/// rotated" model.
const COOKIE_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

/// Lifecycle states of a gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// The two ports a running session is bound to.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    /// Randomly allocated public port.
    pub public_port: u16,
    /// Loopback port of the tunnel bridge.
    pub tunnel_port: u16,
}

/// Live resources owned by a running session.
struct Runtime {
    bridge: TunnelBridge,
    public_cancel: mpsc::Sender<()>,
    stop_tx: watch::Sender<bool>,
}

/// One active reverse-proxy instance bound to one device/session pair.
pub struct GatewaySession {
    weak: Weak<GatewaySession>,
    config: GatewayConfig,
    registry: Arc<dyn SessionRegistry>,
    transport: Arc<dyn TunnelTransport>,
    pages: Arc<dyn ErrorPageRenderer>,
    device_id: String,
    session_key: String,
    state: Mutex<SessionState>,
    /// Memoized `start` outcome, shared by all callers.
    started: OnceCell<Result<Endpoints, Arc<GateError>>>,
    runtime: Mutex<Option<Runtime>>,
    /// Serializes whole lifecycle transitions: a `stop` racing an in-flight
    /// `start` waits for it and then tears down whatever it produced.
    transitions: Mutex<()>,
}

impl GatewaySession {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn SessionRegistry>,
        transport: Arc<dyn TunnelTransport>,
        pages: Arc<dyn ErrorPageRenderer>,
        device_id: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            registry,
            transport,
            pages,
            device_id: device_id.into(),
            session_key: session_key.into(),
            state: Mutex::new(SessionState::Idle),
            started: OnceCell::new(),
            runtime: Mutex::new(None),
            transitions: Mutex::new(()),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("session accessed through its Arc")
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Ports of a started session, `None` before the first `start` completes.
    pub fn endpoints(&self) -> Option<Endpoints> {
        match self.started.get() {
            Some(Ok(endpoints)) => Some(*endpoints),
            _ => None,
        }
    }

    /// Start both listeners. Idempotent: concurrent callers share one
    /// in-flight attempt and later callers get the memoized outcome.
    pub async fn start(&self) -> GateResult<Endpoints> {
        let session = self.arc();
        let outcome = self
            .started
            .get_or_init(|| async move { session.do_start().await.map_err(Arc::new) })
            .await;
        match outcome {
            Ok(endpoints) => Ok(*endpoints),
            Err(e) => Err(GateError::Shared(e.clone())),
        }
    }

    async fn do_start(&self) -> GateResult<Endpoints> {
        let _transition = self.transitions.lock().await;
        {
            // A stop may have won the transition lock while this attempt was
            // queued; starting a stopped session would resurrect it.
            let mut state = self.state.lock().await;
            if matches!(*state, SessionState::Stopping | SessionState::Stopped) {
                return Err(GateError::Stopped);
            }
            *state = SessionState::Starting;
        }
        info!(
            device = %self.device_id,
            session = %self.session_key,
            "starting gateway"
        );

        let (fatal_tx, fatal_rx) = mpsc::channel::<GateError>(4);

        // Tunnel bridge first; failure here is fatal to the attempt.
        let bridge = match TunnelBridge::bind(
            self.transport.clone(),
            self.session_key.clone(),
            self.config.close_grace,
            fatal_tx.clone(),
        )
        .await
        {
            Ok(bridge) => bridge,
            Err(e) => {
                error!(error = %e, "tunnel bridge bind failed");
                *self.state.lock().await = SessionState::Stopped;
                return Err(e);
            }
        };
        let tunnel_port = bridge.local_port();

        // Then the public listener via the allocator; also fatal on failure,
        // and the bridge must not be left bound.
        let listener = match allocator::bind_public(
            &self.config.bind_host,
            self.config.port_low,
            self.config.port_high,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "public port allocation failed");
                bridge.shutdown().await;
                *self.state.lock().await = SessionState::Stopped;
                return Err(e);
            }
        };
        let public_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                bridge.shutdown().await;
                *self.state.lock().await = SessionState::Stopped;
                return Err(GateError::Bind(e.to_string()));
            }
        };

        let (public_cancel, cancel_rx) = mpsc::channel::<()>(1);
        tokio::spawn(public_loop(self.arc(), listener, cancel_rx, fatal_tx));

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(control_loop(
            self.arc(),
            self.transport.subscribe(),
            fatal_rx,
            stop_rx,
        ));

        self.transport.proxy_active(
            &self.session_key,
            Some(GatewayHandle {
                device_id: self.device_id.clone(),
                public_port,
            }),
        );

        let endpoints = Endpoints {
            public_port,
            tunnel_port,
        };
        *self.runtime.lock().await = Some(Runtime {
            bridge,
            public_cancel,
            stop_tx,
        });
        *self.state.lock().await = SessionState::Running;
        info!(public_port, tunnel_port, "gateway running");

        Ok(endpoints)
    }

    /// Stop the session: unregister, close both listeners, and close every
    /// live tunnel connection with the configured grace period.
    ///
    /// Waits for an in-flight `start` to finish before tearing down, so a
    /// completed `stop` never leaves listeners bound or the gateway
    /// registered as active.
    pub async fn stop(&self) {
        let _transition = self.transitions.lock().await;
        {
            let mut state = self.state.lock().await;
            if matches!(
                *state,
                SessionState::Stopping | SessionState::Stopped
            ) {
                return;
            }
            *state = SessionState::Stopping;
        }

        let runtime = self.runtime.lock().await.take();
        if let Some(rt) = runtime {
            let _ = rt.stop_tx.send(true);
            let _ = rt.public_cancel.send(()).await;
            rt.bridge.shutdown().await;
        }
        self.transport.proxy_active(&self.session_key, None);

        *self.state.lock().await = SessionState::Stopped;
        info!(device = %self.device_id, "gateway stopped");
    }

    /// Handshake URL for the current time step, lazily starting the session.
    pub async fn handshake_url(&self) -> GateResult<String> {
        let endpoints = self.start().await?;
        let secret = self
            .registry
            .secret(&self.session_key)
            .ok_or_else(|| GateError::SessionNotFound(self.session_key.clone()))?;
        Ok(format!(
            "{}{}?token={}",
            self.config.public_base(endpoints.public_port),
            self.config.secret_path,
            otp::current_code(&secret)
        ))
    }

    /// Outbound redirect helper: lazily start, then 302 into the handshake.
    pub async fn redirect(&self) -> GateResult<Response<Full<Bytes>>> {
        let url = self.handshake_url().await?;
        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, &url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| GateError::Other(e.to_string()))
    }

    /// Entry point for every request hitting the public listener.
    async fn handle_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        // The device may have been removed or disconnected out of band.
        if !self.registry.exists(&self.session_key) {
            warn!(session = %self.session_key, "registry entry gone, stopping gateway");
            let session = self.arc();
            tokio::spawn(async move { session.stop().await });
            return self.pages.render(StatusCode::NOT_FOUND);
        }

        if req.method() == Method::GET && req.uri().path() == self.config.secret_path {
            return self.handshake(&req);
        }

        if !self.cookie_ok(req.headers()) {
            debug!("session cookie missing or mismatched");
            return self.pages.render(StatusCode::FORBIDDEN);
        }

        self.proxy_request(req).await
    }

    /// One-time-code handshake on the secret path: verify, issue the session
    /// cookie, and bounce to the gateway's base URL.
    fn handshake(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(secret) = self.registry.secret(&self.session_key) else {
            return self.pages.render(StatusCode::NOT_FOUND);
        };

        let valid = query_token(req.uri().query())
            .map(|code| otp::verify(&secret, code))
            .unwrap_or(false);
        if !valid {
            warn!("invalid one-time code on handshake path");
            return self.pages.render(StatusCode::FORBIDDEN);
        }

        let Some(endpoints) = self.endpoints() else {
            return self.pages.render(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly",
            self.config.cookie_name,
            token::cookie_digest(&secret),
            COOKIE_MAX_AGE_SECS
        );
        info!("handshake succeeded, session cookie issued");

        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, self.config.public_base(endpoints.public_port))
            .header(SET_COOKIE, cookie)
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| self.pages.render(StatusCode::INTERNAL_SERVER_ERROR))
    }

    /// Exact-match check of the session cookie against the secret's digest.
    fn cookie_ok(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = self.registry.secret(&self.session_key) else {
            return false;
        };
        let expected = token::cookie_digest(&secret);

        for header in headers.get_all(COOKIE) {
            let Ok(value) = header.to_str() else { continue };
            for pair in value.split(';') {
                if let Some((name, v)) = pair.trim().split_once('=') {
                    if name == self.config.cookie_name && v == expected {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Forward an authenticated request through the tunnel bridge.
    async fn proxy_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(endpoints) = self.endpoints() else {
            return self.pages.render(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let (forwarded_host, forwarded_port) = match (
            self.registry.forwarded_host(&self.session_key),
            self.registry.forwarded_port(&self.session_key),
        ) {
            (Some(host), Some(port)) => (host, port),
            _ => {
                warn!(session = %self.session_key, "forwarding details gone, stopping gateway");
                let session = self.arc();
                tokio::spawn(async move { session.stop().await });
                return self.pages.render(StatusCode::NOT_FOUND);
            }
        };

        let rewriter = match ResponseRewriter::new(
            &self.config.public_scheme,
            &self.config.public_host,
            endpoints.public_port,
            &forwarded_host,
            forwarded_port,
        ) {
            Ok(rewriter) => rewriter,
            Err(e) => {
                warn!(error = %e, "rewriter construction failed");
                return self.pages.render(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let auth = if self.registry.auth_required(&self.session_key) {
            self.registry.auth(&self.session_key)
        } else {
            None
        };
        let target = UpstreamTarget {
            tunnel_port: endpoints.tunnel_port,
            forwarded_host,
            forwarded_port,
            auth,
        };

        match proxy::forward(req, &target, &rewriter, self.config.upstream_timeout).await {
            Ok(response) => response,
            Err(e) => {
                // Per-request isolation: the session stays running.
                warn!(error = %e, "upstream proxy error");
                self.pages.render(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Accept loop of the public listener.
async fn public_loop(
    session: Arc<GatewaySession>,
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    fatal_tx: mpsc::Sender<GateError>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("public listener cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        let session = session.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let session = session.clone();
                                async move {
                                    Ok::<_, Infallible>(session.handle_request(req).await)
                                }
                            });
                            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(io, service)
                                .await
                            {
                                debug!(remote = %remote, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "public accept failed");
                        let _ = fatal_tx.send(GateError::Listener(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Watches the kill-event bus and the fatal-error channel for one session.
async fn control_loop(
    session: Arc<GatewaySession>,
    mut kill_rx: broadcast::Receiver<TunnelEvent>,
    mut fatal_rx: mpsc::Receiver<GateError>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            event = kill_rx.recv() => match event {
                Ok(TunnelEvent::Kill { device_id }) => {
                    if device_id == session.device_id {
                        info!(device = %device_id, "kill signal received, stopping gateway");
                        session.stop().await;
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "kill event bus lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            fatal = fatal_rx.recv() => match fatal {
                Some(e) => {
                    error!(error = %e, "fatal listener error, stopping gateway");
                    session.stop().await;
                    break;
                }
                None => break,
            },
        }
    }
}

/// Extract the `token` query parameter.
fn query_token(query: Option<&str>) -> Option<&str> {
    for pair in query?.split('&') {
        if let Some((name, value)) = pair.split_once('=') {
            if name == "token" {
                return Some(value);
            }
        }
    }
    None
}
