//! Per-request upstream proxying.
//!
//! Each proxied request gets its own upstream client, released when the
//! response completes, so error and rewrite state stay isolated per request.
//! The client decompresses the upstream body in full before the rewriter
//! inspects it — a rewritten body cannot reuse the original compressed
//! length, so buffering here is mandatory.

use crate::registry::UpstreamAuth;
use crate::rewrite::ResponseRewriter;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response};
use rgate_core::{GateError, GateResult};
use std::time::Duration;
use tracing::debug;

/// Where one proxied request goes: the local bridge port plus the upstream
/// identity reconstructed from the registry.
pub struct UpstreamTarget {
    pub tunnel_port: u16,
    pub forwarded_host: String,
    pub forwarded_port: u16,
    pub auth: Option<UpstreamAuth>,
}

/// Forward one request to the tunnel bridge and rewrite the response.
///
/// The original path and method are preserved; the `Host` header is
/// reconstructed from the registry's forwarded host/port; basic-auth
/// material is injected when the device requires it.
pub async fn forward(
    req: Request<Incoming>,
    target: &UpstreamTarget,
    rewriter: &ResponseRewriter,
    timeout: Duration,
) -> GateResult<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| GateError::Upstream(e.to_string()))?
        .to_bytes();

    let url = format!("http://127.0.0.1:{}{}", target.tunnel_port, path_and_query);
    debug!(method = %method, url = %url, "proxying request");

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|e| GateError::Upstream(e.to_string()))?;

    let mut builder = client.request(method, &url);
    for (name, value) in headers.iter() {
        // Host is reconstructed below; length and encoding are the client's
        // business; Accept-Encoding is restricted to codings the client can
        // decompress.
        if name == HOST
            || name == CONTENT_LENGTH
            || name == CONNECTION
            || name == TRANSFER_ENCODING
            || name == ACCEPT_ENCODING
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(
        HOST,
        format!("{}:{}", target.forwarded_host, target.forwarded_port),
    );
    if let Some(auth) = &target.auth {
        builder = builder.basic_auth(&auth.username, Some(&auth.password));
    }

    let upstream = builder
        .body(body)
        .send()
        .await
        .map_err(|e| GateError::Upstream(e.to_string()))?;

    let status = upstream.status();
    let mut resp_headers = upstream.headers().clone();
    // Hop-by-hop headers do not survive re-assembly into a buffered response.
    resp_headers.remove(TRANSFER_ENCODING);
    resp_headers.remove(CONNECTION);

    let body = upstream
        .bytes()
        .await
        .map_err(|e| GateError::Upstream(e.to_string()))?;

    let body = rewriter.rewrite(status, &mut resp_headers, body);

    let mut out = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        out = out.header(name, value);
    }
    out.body(Full::new(body))
        .map_err(|e| GateError::Other(e.to_string()))
}
