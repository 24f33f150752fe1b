//! HTTP proxy inbound
//!
//! Local HTTP/1.1 proxy endpoint for the browser. CONNECT requests are
//! raced and relayed, everything else is forwarded per request.

use super::InboundListener;
use crate::common::{request_id, Target};
use crate::outbound::{empty, BoxBody};
use crate::tunnel::{relay, Tunnel};
use crate::{Error, Result};
use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// HTTP proxy listener
pub struct HttpListener {
    listen: String,
    tunnel: Arc<Tunnel>,
    running: AtomicBool,
    shutdown: Notify,
}

impl HttpListener {
    pub fn new<S: Into<String>>(listen: S, tunnel: Arc<Tunnel>) -> Self {
        HttpListener {
            listen: listen.into(),
            tunnel,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Accept connections on an already bound socket until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("HTTP proxy listening on {}", addr);
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.notified() => break,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    let tunnel = self.tunnel.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(tunnel, stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("HTTP accept error: {}", e);
                    }
                }
            }
        }

        info!("HTTP proxy on {} stopped", addr);
        Ok(())
    }

    async fn handle_connection(tunnel: Arc<Tunnel>, stream: TcpStream, peer_addr: SocketAddr) {
        crate::common::net::configure_tcp_stream(&stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let tunnel = tunnel.clone();
            async move { Ok::<_, Infallible>(handle_request(tunnel, req, peer_addr).await) }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }
}

async fn handle_request(
    tunnel: Arc<Tunnel>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let id = request_id();
    if req.method() == Method::CONNECT {
        handle_connect(tunnel, req, peer_addr, id).await
    } else {
        handle_http(tunnel, req, peer_addr, id).await
    }
}

async fn handle_connect(
    tunnel: Arc<Tunnel>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    id: String,
) -> Response<BoxBody> {
    let target = match req
        .uri()
        .authority()
        .ok_or_else(|| Error::http("CONNECT without authority"))
        .and_then(|authority| Target::from_authority(authority.as_str()))
    {
        Ok(target) => target,
        Err(e) => {
            debug!("[{}] {} bad CONNECT {}: {}", id, peer_addr, req.uri(), e);
            return status(StatusCode::BAD_REQUEST);
        }
    };

    let winner = match tunnel.connect(&target).await {
        Ok(winner) => winner,
        Err(e) => {
            warn!("[{}] {} CONNECT {} failed: {}", id, peer_addr, target, e);
            return status(StatusCode::SERVICE_UNAVAILABLE);
        }
    };
    info!("[{}] {} CONNECT {} via {}", id, peer_addr, target, winner.path);

    let first_read_timeout = tunnel.first_read_timeout();
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!("[{}] upgrade failed: {}", id, e);
                winner.into_stream().close();
                return;
            }
        };

        let mut client = TokioIo::new(upgraded);
        let remote = match winner.commit(&mut client, first_read_timeout).await {
            Ok(remote) => remote,
            Err(e) => {
                debug!("[{}] {}: {}", id, target, e);
                return;
            }
        };

        let (up, down) = relay(client, remote).await;
        debug!("[{}] {} closed, up {} down {}", id, target, up, down);
    });

    status(StatusCode::OK)
}

async fn handle_http(
    tunnel: Arc<Tunnel>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    id: String,
) -> Response<BoxBody> {
    if req.uri().authority().is_none() {
        debug!("[{}] {} non-proxy request {}", id, peer_addr, req.uri());
        return status(StatusCode::BAD_REQUEST);
    }

    info!("[{}] {} {} {}", id, peer_addr, req.method(), req.uri());
    let req = req.map(|body| body.boxed_unsync());

    match tunnel.forward(req).await {
        Ok(resp) => resp.map(|body| body.boxed_unsync()),
        Err(e) => {
            warn!("[{}] forward failed: {}", id, e);
            status(StatusCode::BAD_GATEWAY)
        }
    }
}

fn status(code: StatusCode) -> Response<BoxBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = code;
    resp
}

#[async_trait]
impl InboundListener for HttpListener {
    fn name(&self) -> &str {
        "HTTP"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response() {
        let resp = status(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.status(), 503);
    }
}
