//! Proxy server agent
//!
//! Terminates TLS, speaks HTTP/1.1 and HTTP/2, authenticates
//! `Proxy-Authorization` and serves CONNECT tunnels and forwarded requests.

mod auth;
mod handler;
mod token_cache;

pub use auth::{
    AuthOutcome, Authenticator, TokenInfo, TokenVerifier, FAILED_CHECK_TTL,
    REFRESH_TOKEN_PREFIX, VERIFIED_TTL,
};
pub use handler::{FallbackHandler, NotFound, ProxyService, DEFAULT_REALM};
pub use token_cache::{CachedCheck, TokenCache, SWEEP_INTERVAL};

use crate::inbound::InboundListener;
use crate::outbound::tls;
use crate::Result;
use async_trait::async_trait;
use http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

pub const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve one client connection (HTTP/1.1 or HTTP/2, detected) until it closes
pub async fn serve_connection<I>(io: I, service: Arc<ProxyService>, peer_addr: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let svc = service_fn(move |req: Request<Incoming>| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.handle(req, peer_addr).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http2()
        .initial_stream_window_size(1 << 20)
        .initial_connection_window_size(1 << 20);
    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(io), svc)
        .await
    {
        debug!("connection from {} closed: {}", peer_addr, e);
    }
}

/// TLS listener in front of a [`ProxyService`]
pub struct TlsListener {
    listen: String,
    acceptor: TlsAcceptor,
    service: Arc<ProxyService>,
    running: AtomicBool,
    shutdown: Notify,
}

impl TlsListener {
    pub fn new<S: Into<String>>(
        listen: S,
        server_config: Arc<rustls::ServerConfig>,
        service: Arc<ProxyService>,
    ) -> Self {
        TlsListener {
            listen: listen.into(),
            acceptor: TlsAcceptor::from(server_config),
            service,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Build from PEM certificate and key files
    pub fn from_pem(
        listen: &str,
        cert_file: &str,
        key_file: &str,
        service: Arc<ProxyService>,
    ) -> Result<Self> {
        let server_config = tls::server_config(cert_file, key_file)?;
        Ok(Self::new(listen, server_config, service))
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("proxy server listening on {}", addr);
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.notified() => break,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    crate::common::net::configure_tcp_stream(&stream);
                    let acceptor = self.acceptor.clone();
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        let tls_stream =
                            match tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(stream)).await {
                                Ok(Ok(tls_stream)) => tls_stream,
                                Ok(Err(e)) => {
                                    debug!("TLS accept from {} failed: {}", peer_addr, e);
                                    return;
                                }
                                Err(_) => {
                                    debug!("TLS accept from {} timed out", peer_addr);
                                    return;
                                }
                            };
                        serve_connection(tls_stream, service, peer_addr).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("accept error: {}", e);
                    }
                }
            }
        }

        info!("proxy server on {} stopped", addr);
        Ok(())
    }
}

#[async_trait]
impl InboundListener for TlsListener {
    fn name(&self) -> &str {
        "HTTPS"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        self.serve(listener).await
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
