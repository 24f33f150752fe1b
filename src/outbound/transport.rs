//! HTTP/2 transport to remote proxy hosts
//!
//! One multiplexed HTTP/2-over-TLS connection is kept per proxy host and
//! reopened when it closes. CONNECT tunnels, forwarded plain-HTTP requests
//! and health probes all ride on it.

use super::stream::TunnelStream;
use super::{empty, tls, BoxBody, RemoteStream};
use crate::auth::Credentials;
use crate::common::net::{dial_tcp, strip_hop_by_hop};
use crate::common::Target;
use crate::proxy::HealthProbe;
use crate::{Error, Result};
use async_trait::async_trait;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use hyper::body::Incoming;
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Connect deadline towards proxy hosts
pub const PROXY_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for one request on a proxy connection: response head, plus the
/// upgrade for CONNECT
pub const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// h2 PING cadence on idle proxy connections
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

enum Security {
    Tls(TlsConnector),
    /// Prior-knowledge h2 without TLS
    Cleartext,
}

pub struct ProxyTransport {
    credentials: Arc<Credentials>,
    auth_base_path: String,
    security: Security,
    request_timeout: Duration,
    connections: Mutex<HashMap<String, SendRequest<BoxBody>>>,
}

impl ProxyTransport {
    pub fn new(
        credentials: Arc<Credentials>,
        auth_base_path: String,
        skip_cert_verify: bool,
    ) -> Result<Self> {
        let connector = TlsConnector::from(tls::client_config(skip_cert_verify)?);
        Ok(Self::with_security(credentials, auth_base_path, Security::Tls(connector)))
    }

    /// Speak h2 in cleartext, for proxy hosts behind a trusted link
    pub fn cleartext(credentials: Arc<Credentials>, auth_base_path: String) -> Self {
        Self::with_security(credentials, auth_base_path, Security::Cleartext)
    }

    fn with_security(
        credentials: Arc<Credentials>,
        auth_base_path: String,
        security: Security,
    ) -> Self {
        ProxyTransport {
            credentials,
            auth_base_path,
            security,
            request_timeout: PROXY_REQUEST_TIMEOUT,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Open a CONNECT tunnel to `target` through proxy `host`.
    ///
    /// The round trip, upgrade included, is bounded by the request timeout;
    /// on expiry the pooled connection to `host` is discarded.
    pub async fn open_tunnel(&self, host: &str, target: &Target) -> Result<RemoteStream> {
        match timeout(self.request_timeout, self.connect_tunnel(host, target)).await {
            Ok(result) => result,
            Err(_) => {
                self.evict(host);
                Err(Error::timeout(format!(
                    "CONNECT {} via {} timed out after {:?}",
                    target, host, self.request_timeout
                )))
            }
        }
    }

    async fn connect_tunnel(&self, host: &str, target: &Target) -> Result<RemoteStream> {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri(target.to_string())
            .version(Version::HTTP_2)
            .header(PROXY_AUTHORIZATION, self.credentials.basic_header()?)
            .body(empty())?;

        let resp = self.send(host, req).await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::proxy(format!(
                "CONNECT {} via {} rejected with {}",
                target, host, status
            )));
        }

        let upgraded = hyper::upgrade::on(resp).await.map_err(|e| {
            self.evict(host);
            Error::proxy(format!("CONNECT {} via {}: {}", target, host, e))
        })?;
        debug!("tunnel to {} via {} established", target, host);
        Ok(RemoteStream::Tunnel(TunnelStream::new(upgraded)))
    }

    /// Forward a plain HTTP request through proxy `host`.
    ///
    /// The destination authority is kept, the scheme becomes `https`.
    pub async fn forward(&self, host: &str, mut req: Request<BoxBody>) -> Result<Response<Incoming>> {
        let authority = match req.uri().authority() {
            Some(authority) => authority.clone(),
            None => return Err(Error::http(format!("missing authority in {}", req.uri()))),
        };
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("https://{}{}", authority, path)
            .parse()
            .map_err(|e| Error::http(format!("invalid uri: {}", e)))?;

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_2;
        strip_hop_by_hop(req.headers_mut());
        req.headers_mut().remove(HOST);
        req.headers_mut()
            .insert(PROXY_AUTHORIZATION, self.credentials.basic_header()?);

        self.send(host, req).await
    }

    /// `GET https://<host><auth_base_path>health`; any 2xx is healthy
    pub async fn health(&self, host: &str) -> Result<()> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("https://{}{}health", host, self.auth_base_path))
            .version(Version::HTTP_2)
            .header(PROXY_AUTHORIZATION, self.credentials.basic_header()?)
            .body(empty())?;

        let status = self.send(host, req).await?.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::proxy(format!("health check on {} returned {}", host, status)))
        }
    }

    /// One request/response-head exchange, bounded by the request timeout
    async fn send(&self, host: &str, req: Request<BoxBody>) -> Result<Response<Incoming>> {
        let exchange = async {
            let mut sender = self.sender(host).await?;
            sender.ready().await.map_err(|e| {
                self.evict(host);
                Error::proxy(format!("connection to {} unusable: {}", host, e))
            })?;
            sender.send_request(req).await.map_err(|e| {
                self.evict(host);
                Error::from(e)
            })
        };

        match timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.evict(host);
                Err(Error::timeout(format!(
                    "request to {} timed out after {:?}",
                    host, self.request_timeout
                )))
            }
        }
    }

    fn evict(&self, host: &str) {
        if self.connections.lock().remove(host).is_some() {
            debug!("dropped pooled connection to {}", host);
        }
    }

    /// Cached connection to `host`, reconnecting when closed
    async fn sender(&self, host: &str) -> Result<SendRequest<BoxBody>> {
        if let Some(sender) = self.connections.lock().get(host) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let sender = self.connect(host).await?;
        self.connections
            .lock()
            .insert(host.to_string(), sender.clone());
        Ok(sender)
    }

    async fn connect(&self, host: &str) -> Result<SendRequest<BoxBody>> {
        let endpoint = Target::from_authority(host)?;
        let stream = dial_tcp(&endpoint.to_string(), PROXY_DIAL_TIMEOUT).await?;

        match &self.security {
            Security::Tls(connector) => {
                let server_name = tls::server_name(&endpoint.host)?;
                let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| Error::timeout(format!("TLS handshake with {} timed out", host)))?
                    .map_err(|e| Error::tls(format!("TLS handshake with {} failed: {}", host, e)))?;
                handshake(tls_stream, host).await
            }
            Security::Cleartext => handshake(stream, host).await,
        }
    }
}

/// HTTP/2 client handshake over an established byte stream.
///
/// Keep-alive PINGs close a connection whose peer stopped answering.
pub async fn handshake<I>(io: I, label: &str) -> Result<SendRequest<BoxBody>>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .keep_alive_interval(KEEP_ALIVE_INTERVAL)
        .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| Error::proxy(format!("h2 handshake with {} failed: {}", label, e)))?;

    let label = label.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("h2 connection to {} closed: {}", label, e);
        } else {
            trace!("h2 connection to {} finished", label);
        }
    });
    Ok(sender)
}

#[async_trait]
impl HealthProbe for ProxyTransport {
    async fn probe(&self, host: &str) -> Result<()> {
        self.health(host).await
    }
}
