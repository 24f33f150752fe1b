//! Direct outbound (no proxy)

use super::{BoxBody, RemoteStream};
use crate::common::net::{dial_tcp, strip_hop_by_hop};
use crate::common::Target;
use crate::{Error, Result};
use http::header::HOST;
use http::uri::{PathAndQuery, Uri};
use http::{HeaderValue, Request, Response, Version};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tracing::debug;

/// Connect deadline towards destinations
pub const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a plain TCP connection to the destination
pub async fn dial(target: &Target) -> Result<RemoteStream> {
    debug!("Direct connecting to {}", target);
    let stream = dial_tcp(&target.to_string(), DIRECT_DIAL_TIMEOUT).await?;
    Ok(RemoteStream::Tcp(stream))
}

/// Send one HTTP/1.1 request to the origin and return its response.
///
/// The request target is rewritten to origin-form and hop-by-hop headers
/// are dropped; the response streams back untouched.
pub async fn forward_http(target: &Target, mut req: Request<BoxBody>) -> Result<Response<Incoming>> {
    let stream = dial_tcp(&target.to_string(), DIRECT_DIAL_TIMEOUT).await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let origin = target.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("origin connection {} closed: {}", origin, e);
        }
    });

    prepare_origin_request(target, &mut req)?;
    debug!("Direct {} {} -> {}", req.method(), req.uri(), target);

    Ok(sender.send_request(req).await?)
}

fn prepare_origin_request(target: &Target, req: &mut Request<BoxBody>) -> Result<()> {
    let host = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => match req.headers().get(HOST) {
            Some(host) => host
                .to_str()
                .map_err(|_| Error::http("invalid Host header"))?
                .to_string(),
            None => target.to_string(),
        },
    };

    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);
    *req.version_mut() = Version::HTTP_11;

    strip_hop_by_hop(req.headers_mut());
    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&host).map_err(|_| Error::http(format!("invalid host {}", host)))?,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::empty;

    #[test]
    fn test_prepare_origin_request() {
        let mut req = Request::builder()
            .uri("http://example.com:8080/a/b?c=d")
            .header("proxy-connection", "keep-alive")
            .header("accept", "*/*")
            .body(empty())
            .unwrap();
        let target = Target::from_uri(req.uri()).unwrap();

        prepare_origin_request(&target, &mut req).unwrap();

        assert_eq!(req.uri(), "/a/b?c=d");
        assert_eq!(req.headers()[HOST], "example.com:8080");
        assert!(!req.headers().contains_key("proxy-connection"));
        assert!(req.headers().contains_key("accept"));
    }

    #[test]
    fn test_prepare_origin_form_keeps_host() {
        let mut req = Request::builder()
            .uri("/index.html")
            .header(HOST, "example.org")
            .body(empty())
            .unwrap();
        let target = Target::new("example.org", 80);

        prepare_origin_request(&target, &mut req).unwrap();
        assert_eq!(req.headers()[HOST], "example.org");
        assert_eq!(req.uri(), "/index.html");
    }

    #[tokio::test]
    async fn test_dial_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = dial(&Target::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(stream.kind(), "tcp");
    }
}
