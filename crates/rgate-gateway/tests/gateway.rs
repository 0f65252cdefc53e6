//! End-to-end gateway tests: a canned upstream behind a TCP "tunnel",
//! a real public listener, and reqwest playing the browser.

use rgate_core::GateError;
use rgate_gateway::{
    BasicPages, GatewayConfig, GatewaySession, MemoryRegistry, SessionEntry, SessionState,
    TcpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP/1.1 upstream standing in for the device's local service.
async fn spawn_upstream() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = canned_response(&path, port);
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

fn canned_response(path: &str, port: u16) -> String {
    if path.starts_with("/redir") {
        return format!(
            "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{port}/y\r\n\
             Content-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }
    if path.starts_with("/page") {
        let body =
            format!(r#"<html><body><a href="http://127.0.0.1:{port}/x">link</a></body></html>"#);
        return format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
    }
    let body = "hello from device";
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}

struct Harness {
    session: Arc<GatewaySession>,
    registry: Arc<MemoryRegistry>,
    transport: Arc<TcpTransport>,
    secret: Vec<u8>,
    upstream_port: u16,
}

/// Build a gateway over a fresh upstream. Each test gets its own port range
/// so parallel tests cannot contend for public ports.
async fn harness(port_low: u16, port_high: u16, device: &str, key: &str) -> Harness {
    let upstream_port = spawn_upstream().await;
    let secret = rgate_core::generate_secret();

    let registry = Arc::new(MemoryRegistry::new());
    registry.insert(
        key.to_string(),
        SessionEntry {
            device_id: device.to_string(),
            secret: secret.clone(),
            forwarded_host: "127.0.0.1".to_string(),
            forwarded_port: upstream_port,
            auth: None,
        },
    );

    let transport = Arc::new(TcpTransport::new("127.0.0.1", upstream_port));
    let config = GatewayConfig::load(
        None,
        Some("http://127.0.0.1"),
        Some(port_low),
        Some(port_high),
    )
    .unwrap();
    let session = GatewaySession::new(
        config,
        registry.clone(),
        transport.clone(),
        Arc::new(BasicPages),
        device,
        key,
    );

    Harness {
        session,
        registry,
        transport,
        secret,
        upstream_port,
    }
}

fn browser() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Run the handshake and return (public base URL, session cookie pair).
async fn handshake(h: &Harness) -> (String, String) {
    let url = h.session.handshake_url().await.unwrap();
    let resp = browser().get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 302);

    let cookie = resp
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .expect("handshake must set the session cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let base = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    (base, cookie)
}

#[tokio::test]
async fn handshake_then_cookie_session() {
    let h = harness(45100, 45149, "dev-a", "sess-a").await;
    let (base, cookie) = handshake(&h).await;

    // Cookie alone suffices on any other path.
    let resp = browser()
        .get(format!("{base}/plain"))
        .header(reqwest::header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hello from device");

    // Neither code nor cookie: rejected.
    let resp = browser().get(format!("{base}/plain")).send().await.unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn bad_one_time_code_is_forbidden() {
    let h = harness(45150, 45199, "dev-b", "sess-b").await;
    let endpoints = h.session.start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", endpoints.public_port);

    let resp = browser()
        .get(format!("{base}/.rgate?token=000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert!(resp.headers().get(reqwest::header::SET_COOKIE).is_none());
    assert_eq!(h.session.state().await, SessionState::Running);
}

#[tokio::test]
async fn concurrent_start_is_idempotent() {
    let h = harness(45200, 45249, "dev-c", "sess-c").await;

    let (a, b) = tokio::join!(h.session.start(), h.session.start());
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.public_port, b.public_port);
    assert_eq!(a.tunnel_port, b.tunnel_port);

    // And again after completion: still the same endpoints.
    let c = h.session.start().await.unwrap();
    assert_eq!(a.public_port, c.public_port);
}

#[tokio::test]
async fn start_registers_gateway_with_transport() {
    let h = harness(45250, 45299, "dev-d", "sess-d").await;
    let endpoints = h.session.start().await.unwrap();

    let handle = h.transport.active_handle("sess-d").unwrap();
    assert_eq!(handle.device_id, "dev-d");
    assert_eq!(handle.public_port, endpoints.public_port);

    h.session.stop().await;
    assert!(h.transport.active_handle("sess-d").is_none());
}

#[tokio::test]
async fn stale_registry_yields_404_and_stops() {
    let h = harness(45300, 45349, "dev-e", "sess-e").await;
    let (base, cookie) = handshake(&h).await;

    h.registry.remove("sess-e");

    let resp = browser()
        .get(format!("{base}/plain"))
        .header(reqwest::header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // The session tears itself down; afterwards nothing is accepted.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.session.state().await, SessionState::Stopped);
    assert!(browser()
        .get(format!("{base}/plain"))
        .header(reqwest::header::COOKIE, &cookie)
        .send()
        .await
        .is_err());
}

#[tokio::test]
async fn kill_stops_matching_device_only() {
    let upstream_port = spawn_upstream().await;
    let registry = Arc::new(MemoryRegistry::new());
    let transport = Arc::new(TcpTransport::new("127.0.0.1", upstream_port));

    let mut sessions = Vec::new();
    for (device, key, low, high) in [
        ("dev-f", "sess-f", 45350, 45374),
        ("dev-g", "sess-g", 45375, 45399),
    ] {
        registry.insert(
            key.to_string(),
            SessionEntry {
                device_id: device.to_string(),
                secret: rgate_core::generate_secret(),
                forwarded_host: "127.0.0.1".to_string(),
                forwarded_port: upstream_port,
                auth: None,
            },
        );
        let config =
            GatewayConfig::load(None, Some("http://127.0.0.1"), Some(low), Some(high)).unwrap();
        let session = GatewaySession::new(
            config,
            registry.clone(),
            transport.clone(),
            Arc::new(BasicPages),
            device,
            key,
        );
        session.start().await.unwrap();
        sessions.push(session);
    }

    transport.kill("dev-f");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(sessions[0].state().await, SessionState::Stopped);
    assert_eq!(sessions[1].state().await, SessionState::Running);
}

#[tokio::test]
async fn stop_during_start_never_leaves_running() {
    // Whichever side wins the race, a completed stop must leave the session
    // stopped and unregistered, never with live listeners.
    for _ in 0..50 {
        let h = harness(45600, 45649, "dev-l", "sess-l").await;

        let starter = {
            let session = h.session.clone();
            tokio::spawn(async move {
                let _ = session.start().await;
            })
        };
        let stopper = {
            let session = h.session.clone();
            tokio::spawn(async move {
                session.stop().await;
            })
        };
        let _ = tokio::join!(starter, stopper);

        assert_eq!(h.session.state().await, SessionState::Stopped);
        assert!(h.transport.active_handle("sess-l").is_none());
    }
}

#[tokio::test]
async fn exhausted_range_fails_start_and_cleans_up() {
    // Occupy the only port in the range so allocation cannot succeed.
    let blocker = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
    let port = blocker.local_addr().unwrap().port();
    let h = harness(port, port, "dev-m", "sess-m").await;

    let (a, b) = tokio::join!(h.session.start(), h.session.start());
    for result in [a, b] {
        match result.unwrap_err() {
            GateError::Shared(inner) => {
                assert!(matches!(*inner, GateError::PortExhausted(_)))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // The failed attempt reaches the terminal state with nothing left bound
    // or registered.
    assert_eq!(h.session.state().await, SessionState::Stopped);
    assert!(h.session.endpoints().is_none());
    assert!(h.transport.active_handle("sess-m").is_none());
}

#[tokio::test]
async fn redirect_helper_lazily_starts() {
    let h = harness(45400, 45449, "dev-h", "sess-h").await;
    assert_eq!(h.session.state().await, SessionState::Idle);

    let resp = h.session.redirect().await.unwrap();
    assert_eq!(resp.status(), 302);
    let location = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.contains("/.rgate?token="));
    assert_eq!(h.session.state().await, SessionState::Running);
}

#[tokio::test]
async fn html_links_rewritten_through_proxy() {
    let h = harness(45450, 45499, "dev-i", "sess-i").await;
    let (base, cookie) = handshake(&h).await;

    let resp = browser()
        .get(format!("{base}/page"))
        .header(reqwest::header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    let public_port = h.session.endpoints().unwrap().public_port;
    assert!(body.contains(&format!(r#"href="http://127.0.0.1:{public_port}/x""#)));
    assert!(!body.contains(&format!(":{}", h.upstream_port)));
}

#[tokio::test]
async fn redirect_location_rewritten_through_proxy() {
    let h = harness(45500, 45549, "dev-j", "sess-j").await;
    let (base, cookie) = handshake(&h).await;

    let resp = browser()
        .get(format!("{base}/redir"))
        .header(reqwest::header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 302);
    let public_port = h.session.endpoints().unwrap().public_port;
    assert_eq!(
        resp.headers()
            .get(reqwest::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap(),
        &format!("http://127.0.0.1:{public_port}/y")
    );
}

#[tokio::test]
async fn wrong_cookie_is_forbidden() {
    let h = harness(45550, 45599, "dev-k", "sess-k").await;
    let (base, _cookie) = handshake(&h).await;

    let resp = browser()
        .get(format!("{base}/plain"))
        .header(reqwest::header::COOKIE, "rgateToken=deadbeef")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // The real digest still works afterwards.
    let digest = rgate_core::cookie_digest(&h.secret);
    let resp = browser()
        .get(format!("{base}/plain"))
        .header(reqwest::header::COOKIE, format!("rgateToken={digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
