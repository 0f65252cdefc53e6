//! Error-page renderer collaborator.
//!
//! The hosting application usually brings its own branded templates; the
//! gateway only needs something to hand 403/404/500 responses to instead of
//! emitting a bare status line.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};

/// Renders an error response for the given status.
pub trait ErrorPageRenderer: Send + Sync {
    fn render(&self, status: StatusCode) -> Response<Full<Bytes>>;
}

/// Minimal HTML error pages.
#[derive(Default)]
pub struct BasicPages;

impl ErrorPageRenderer for BasicPages {
    fn render(&self, status: StatusCode) -> Response<Full<Bytes>> {
        let code = status.as_u16();
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!(
            "<!DOCTYPE html><html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1></body></html>"
        );
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_status_and_reason() {
        let resp = BasicPages.render(StatusCode::FORBIDDEN);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }
}
