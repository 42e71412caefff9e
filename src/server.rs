//! HTTP plumbing shared by the three services

use crate::error::ApiError;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_DISPOSITION, CONTENT_TYPE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the services
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub type HttpResponse = Response<Full<Bytes>>;

/// A service's request router
pub trait Handler: Send + Sync + 'static {
    /// Short service name used in logs
    fn name(&self) -> &'static str;

    fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> impl Future<Output = HttpResponse> + Send;
}

/// Helper to create a plain text response
pub fn response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Serialize `value` into a JSON response
pub fn json_value_response<T: serde::Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_string(value) {
        Ok(body) => json_response(status, body),
        Err(e) => crate::error::json_error_response(&ApiError::Json(e)),
    }
}

/// Helper to create a downloadable file response
pub fn attachment_response(
    content_type: &'static str,
    filename: &str,
    body: impl Into<Bytes>,
) -> HttpResponse {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_DISPOSITION, disposition)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Full::new(body.into()))
        .expect("valid response with static headers")
}

/// CORS preflight answer, any origin allowed
fn preflight_response() -> HttpResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .body(Full::new(Bytes::new()))
        .expect("valid response with static headers")
}

/// Collect a request body, rejecting anything over `limit` bytes
pub async fn read_body(req: Request<Incoming>, limit: u64) -> Result<Bytes, ApiError> {
    let body = Limited::new(req.into_body(), body_limit(limit));
    match body.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ApiError::PayloadTooLarge(limit))
        }
        Err(e) => Err(ApiError::Validation(format!(
            "Failed to read request body: {}",
            e
        ))),
    }
}

/// Configured limit as a buffer size, saturating where `usize` is narrower
fn body_limit(limit: u64) -> usize {
    usize::try_from(limit).unwrap_or(usize::MAX)
}

/// Extract the segment after `prefix`, rejecting empty values and nested paths
pub fn path_param<'a>(path: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let param = path.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if param.is_empty() || param.contains('/') {
        return None;
    }
    Some(param)
}

/// Routes shared by every service, then the service's own routes
async fn dispatch<H: Handler>(handler: Arc<H>, req: Request<Incoming>) -> HttpResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(service = handler.name(), %method, %path, "Request");

    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => preflight_response(),
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "service": handler.name(),
            });
            json_response(StatusCode::OK, version_info.to_string())
        }
        _ => handler.handle(req).await,
    }
}

/// HTTP server running one service handler
pub struct HttpServer<H> {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<H: Handler> HttpServer<H> {
    /// Bind the listener. Port 0 picks a free port, see [`local_addr`](Self::local_addr).
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<H>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            handler,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let service = self.handler.name();
        info!(addr = %self.local_addr, service, "Server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(service, "Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S, H>(stream: S, handler: Arc<H>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(dispatch(handler, req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_param() {
        assert_eq!(path_param("/get_cheatsheet/abc", "/get_cheatsheet/", ""), Some("abc"));
        assert_eq!(path_param("/cheatsheets/abc/html", "/cheatsheets/", "/html"), Some("abc"));
        assert_eq!(path_param("/cheatsheets/", "/cheatsheets/", ""), None);
        assert_eq!(path_param("/cheatsheets/a/b", "/cheatsheets/", ""), None);
        assert_eq!(path_param("/other/abc", "/cheatsheets/", ""), None);
    }

    #[test]
    fn test_body_limit_saturates() {
        assert_eq!(body_limit(16 * 1024 * 1024), 16 * 1024 * 1024);
        assert_eq!(body_limit(0), 0);
        assert_eq!(body_limit(u64::MAX), usize::MAX);
    }

    #[test]
    fn test_json_response_headers() {
        let resp = json_response(StatusCode::OK, "{}");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn test_attachment_response_headers() {
        let resp = attachment_response("text/html; charset=utf-8", "abc.html", "<html></html>");
        assert_eq!(
            resp.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"abc.html\""
        );
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_preflight_allows_any_origin() {
        let resp = preflight_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert!(resp.headers().get(ACCESS_CONTROL_ALLOW_METHODS).is_some());
    }
}
