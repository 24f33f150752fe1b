//! Per-request dispatch on the server

use super::auth::{AuthOutcome, Authenticator};
use crate::common::net::strip_hop_by_hop;
use crate::common::{request_id, Target};
use crate::outbound::{direct, empty, full, BoxBody};
use crate::tunnel::relay;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::uri::{PathAndQuery, Uri};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_REALM: &str = "Hi, please show me your token!";

/// Handles traffic that is neither authenticated proxying nor the
/// auth trigger
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, req: Request<BoxBody>, peer_addr: SocketAddr) -> Response<BoxBody>;
}

/// Answers every request with 404
pub struct NotFound;

#[async_trait]
impl FallbackHandler for NotFound {
    async fn handle(&self, _req: Request<BoxBody>, _peer_addr: SocketAddr) -> Response<BoxBody> {
        status(StatusCode::NOT_FOUND)
    }
}

pub struct ProxyService {
    authenticator: Arc<Authenticator>,
    fallback: Arc<dyn FallbackHandler>,
    trigger_path: String,
    health_path: String,
    hostname: Option<String>,
    realm: HeaderValue,
}

impl ProxyService {
    pub fn new(
        authenticator: Arc<Authenticator>,
        fallback: Arc<dyn FallbackHandler>,
        auth_base_path: &str,
        hostname: Option<String>,
    ) -> Result<Self> {
        let realm = HeaderValue::from_str(&format!("Basic realm=\"{}\"", DEFAULT_REALM))
            .map_err(|e| Error::config(format!("invalid realm: {}", e)))?;

        Ok(ProxyService {
            authenticator,
            fallback,
            trigger_path: format!("{}407", auth_base_path),
            health_path: format!("{}health", auth_base_path),
            hostname: hostname.map(|h| h.to_ascii_lowercase()),
            realm,
        })
    }

    pub async fn handle<B>(&self, mut req: Request<B>, peer_addr: SocketAddr) -> Response<BoxBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        if self.is_health_check(&req) {
            return Response::new(full("OK"));
        }

        let header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let outcome = self.authenticator.authenticate(header.as_deref()).await;

        if req.method() == Method::GET && req.uri().path().ends_with(&self.trigger_path) {
            return self.auth_trigger(&outcome);
        }

        let username = match outcome {
            AuthOutcome::Authorized(username) => username,
            AuthOutcome::Denied(claimed) => {
                match claimed {
                    Some(user) => debug!("{{{}}} {} {} {}", user, peer_addr, req.method(), req.uri()),
                    None => debug!("[normal] {} {} {}", peer_addr, req.method(), req.uri()),
                }
                let req = req.map(|body| body.boxed_unsync());
                return self.fallback.handle(req, peer_addr).await;
            }
        };

        let id = request_id();
        info!("[{}] [{}] {} {}", id, username, req.method(), req.uri());
        strip_hop_by_hop(req.headers_mut());
        req.headers_mut().remove(PROXY_AUTHORIZATION);

        if req.method() == Method::CONNECT {
            handle_connect(req, id).await
        } else {
            handle_http(req, id).await
        }
    }

    /// `GET <base>health` addressed to this server
    fn is_health_check<B>(&self, req: &Request<B>) -> bool {
        if req.method() != Method::GET || req.uri().path() != self.health_path {
            return false;
        }
        match (&self.hostname, request_host(req)) {
            (Some(hostname), Some(host)) => Target::from_authority(host)
                .map(|target| target.host.eq_ignore_ascii_case(hostname))
                .unwrap_or(false),
            _ => true,
        }
    }

    fn auth_trigger(&self, outcome: &AuthOutcome) -> Response<BoxBody> {
        if outcome.is_authorized() {
            return status(StatusCode::OK);
        }
        let mut resp = status(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        resp.headers_mut().insert(PROXY_AUTHENTICATE, self.realm.clone());
        resp
    }
}

async fn handle_connect<B>(req: Request<B>, id: String) -> Response<BoxBody>
where
    B: Send + 'static,
{
    let target = match req
        .uri()
        .authority()
        .ok_or_else(|| Error::http("CONNECT without authority"))
        .and_then(|authority| Target::from_authority(authority.as_str()))
    {
        Ok(target) => target,
        Err(e) => {
            debug!("[{}] bad CONNECT {}: {}", id, req.uri(), e);
            return status(StatusCode::BAD_REQUEST);
        }
    };

    let remote = match direct::dial(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("[{}] dial {} failed: {}", id, target, e);
            return text(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let (up, down) = relay(TokioIo::new(upgraded), remote).await;
                debug!("[{}] {} closed, up {} down {}", id, target, up, down);
            }
            Err(e) => {
                debug!("[{}] upgrade failed: {}", id, e);
                remote.close();
            }
        }
    });

    status(StatusCode::OK)
}

async fn handle_http<B>(mut req: Request<B>, id: String) -> Response<BoxBody>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
{
    let uri = match origin_uri(&req) {
        Ok(uri) => uri,
        Err(e) => {
            debug!("[{}] {}", id, e);
            return status(StatusCode::BAD_REQUEST);
        }
    };
    *req.uri_mut() = uri;

    let forwarded = match Target::from_uri(req.uri()) {
        Ok(target) => direct::forward_http(&target, req.map(|body| body.boxed_unsync())).await,
        Err(e) => Err(e),
    };

    match forwarded {
        Ok(resp) => {
            let mut resp = resp.map(|body| body.boxed_unsync());
            strip_hop_by_hop(resp.headers_mut());
            resp
        }
        Err(e) => {
            warn!("[{}] forward failed: {}", id, e);
            text(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// `http://<authority><path>` for a forwarded request.
///
/// HTTP/2 clients send the destination with an `https` scheme; the origin
/// is always reached in cleartext.
fn origin_uri<B>(req: &Request<B>) -> Result<Uri> {
    let authority = match request_host(req) {
        Some(host) => host.to_string(),
        None => return Err(Error::http(format!("no destination in {}", req.uri()))),
    };
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    format!("http://{}{}", authority, path)
        .parse()
        .map_err(|e| Error::http(format!("invalid uri: {}", e)))
}

/// Authority from the request target, else the Host header
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    match req.uri().authority() {
        Some(authority) => Some(authority.as_str()),
        None => req.headers().get(HOST).and_then(|v| v.to_str().ok()),
    }
}

fn status(code: StatusCode) -> Response<BoxBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = code;
    resp
}

fn text(code: StatusCode, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = code;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::token_cache::TokenCache;
    use base64::Engine;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn service(hostname: Option<&str>) -> ProxyService {
        let mut tokens = HashMap::new();
        tokens.insert("alice".to_string(), "secret".to_string());
        let authenticator = Arc::new(Authenticator::new(tokens, Arc::new(TokenCache::new()), None));
        ProxyService::new(authenticator, Arc::new(NotFound), "/auth/", hostname.map(String::from))
            .unwrap()
    }

    fn request(method: Method, uri: &str, authorized: bool) -> Request<BoxBody> {
        let mut builder = Request::builder().method(method).uri(uri);
        if authorized {
            let encoded = base64::engine::general_purpose::STANDARD.encode("alice:secret");
            builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", encoded));
        }
        builder.body(empty()).unwrap()
    }

    #[tokio::test]
    async fn test_auth_trigger() {
        let service = service(None);

        let resp = service
            .handle(request(Method::GET, "https://proxy.example/auth/407", false), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        let challenge = resp.headers()[PROXY_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.starts_with("Basic realm="));

        let resp = service
            .handle(request(Method::GET, "https://proxy.example/auth/407", true), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let service = service(Some("proxy.example"));

        let resp = service
            .handle(request(Method::GET, "https://proxy.example/auth/health", false), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = service
            .handle(request(Method::GET, "https://proxy.example:443/auth/health", false), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // the same path on another host is not ours
        let resp = service
            .handle(request(Method::GET, "https://other.example/auth/health", false), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unauthenticated_goes_to_fallback() {
        let service = service(None);
        let resp = service
            .handle(request(Method::GET, "https://proxy.example/", false), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connect_dial_failure_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let resp = service(None)
            .handle(request(Method::CONNECT, &format!("127.0.0.1:{}", port), true), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forward_rewrites_to_cleartext_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let _ = seen_tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        });

        let uri = format!("https://127.0.0.1:{}/index.html?x=1", port);
        let resp = service(None).handle(request(Method::GET, &uri, true), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key("connection"));

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let head = seen_rx.await.unwrap();
        assert!(head.starts_with("GET /index.html?x=1 HTTP/1.1\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
    }

    #[test]
    fn test_origin_uri_from_host_header() {
        let req = Request::builder()
            .uri("/a?b=c")
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(origin_uri(&req).unwrap(), "http://example.com:8080/a?b=c");

        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(origin_uri(&req).is_err());
    }
}
