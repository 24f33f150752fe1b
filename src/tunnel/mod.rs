//! Tunnel core - decides how each destination is reached

mod racer;
mod relay;

pub use racer::{Connector, PathKind, Racer, Route, Winner, FIRST_READ_BUFFER_SIZE};
pub use relay::{relay, RELAY_BUFFER_SIZE};

use crate::common::Target;
use crate::config::ClientConfig;
use crate::outbound::{direct, BoxBody, DetectProbe, ProxyTransport, RemoteStream};
use crate::proxy::{Proxy, ProxyRegistry};
use crate::rule::{Decision, DetectionCache, PolicyResolver};
use crate::{Error, Result};
use async_trait::async_trait;
use http::{Request, Response};
use hyper::body::Incoming;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Production connector: plain TCP for direct, an h2 CONNECT tunnel
/// through a selected proxy host otherwise
pub struct Dialer {
    transport: Arc<ProxyTransport>,
}

impl Dialer {
    pub fn new(transport: Arc<ProxyTransport>) -> Self {
        Dialer { transport }
    }
}

#[async_trait]
impl Connector for Dialer {
    async fn dial_direct(&self, target: &Target) -> Result<RemoteStream> {
        direct::dial(target).await
    }

    async fn dial_proxy(&self, proxy: &Proxy, target: &Target) -> Result<RemoteStream> {
        let host = proxy.select()?;
        debug!("{} via {} ({})", target, host, proxy.name());
        self.transport.open_tunnel(&host, target).await
    }
}

/// Tunnel core - resolves routes and hands out remote streams
pub struct Tunnel {
    resolver: PolicyResolver,
    registry: Arc<ProxyRegistry>,
    detect_cache: Arc<DetectionCache>,
    transport: Arc<ProxyTransport>,
    racer: Racer,
    detect_probe: DetectProbe,
    detect_delay: Duration,
    first_read_timeout: Duration,
}

impl Tunnel {
    pub fn new(
        config: &ClientConfig,
        registry: Arc<ProxyRegistry>,
        transport: Arc<ProxyTransport>,
    ) -> Result<Self> {
        let detect_cache = Arc::new(DetectionCache::new(config.unmatched_policy.detect_expires()));
        let dialer = Arc::new(Dialer::new(transport.clone()));
        Self::with_connector(config, registry, transport, dialer, detect_cache)
    }

    /// Build with a custom connector for the tunneling path
    pub fn with_connector(
        config: &ClientConfig,
        registry: Arc<ProxyRegistry>,
        transport: Arc<ProxyTransport>,
        connector: Arc<dyn Connector>,
        detect_cache: Arc<DetectionCache>,
    ) -> Result<Self> {
        let resolver = PolicyResolver::new(config);
        info!("Loaded {} rules", resolver.rule_count());

        Ok(Tunnel {
            resolver,
            registry,
            racer: Racer::new(connector, detect_cache.clone()),
            detect_cache,
            transport,
            detect_probe: DetectProbe::new()?,
            detect_delay: config.unmatched_policy.detect_delay(),
            first_read_timeout: config.first_read_timeout(),
        })
    }

    /// Route for a destination, consulting the detection cache
    pub fn route(&self, target: &Target) -> Result<Route> {
        let domain = target.domain();
        let route = match self.resolver.resolve(&domain) {
            Decision::Direct => Route::Direct,
            Decision::Proxy(name) => Route::Proxy(self.proxy(name)?),
            Decision::Detect(name) => {
                let proxy = self.proxy(name)?;
                if self.detect_cache.is_failing(&domain) {
                    Route::Proxy(proxy)
                } else {
                    Route::Race {
                        proxy,
                        delay: self.detect_delay,
                    }
                }
            }
        };
        debug!("{} -> {:?}", target, route);
        Ok(route)
    }

    /// Race the allowed paths to `target`; the caller commits the winner
    pub async fn connect(&self, target: &Target) -> Result<Winner> {
        let route = self.route(target)?;
        self.racer.race(target, &route).await
    }

    /// Forward one plain HTTP request according to the destination's route
    pub async fn forward(&self, req: Request<BoxBody>) -> Result<Response<Incoming>> {
        let target = Target::from_uri(req.uri())?;

        match self.route(&target)? {
            Route::Direct => direct::forward_http(&target, req).await,
            Route::Proxy(proxy) => self.forward_via(&proxy, req).await,
            Route::Race { proxy, .. } => match self.detect_probe.probe(&target).await {
                Ok(()) => direct::forward_http(&target, req).await,
                Err(e) => {
                    debug!("detect probe to {} failed: {}", target, e);
                    self.detect_cache.record_failure(&target.domain());
                    self.forward_via(&proxy, req).await
                }
            },
        }
    }

    async fn forward_via(&self, proxy: &Proxy, req: Request<BoxBody>) -> Result<Response<Incoming>> {
        let host = proxy.select()?;
        self.transport.forward(&host, req).await
    }

    fn proxy(&self, name: &str) -> Result<Arc<Proxy>> {
        self.registry
            .get(name)
            .ok_or_else(|| Error::proxy(format!("Proxy not found: {}", name)))
    }

    pub fn first_read_timeout(&self) -> Duration {
        self.first_read_timeout
    }

    pub fn detect_cache(&self) -> &Arc<DetectionCache> {
        &self.detect_cache
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;

    const CONFIG: &str = r#"
username: alice
token: secret
proxies:
  - name: main
    hosts: ["p1.example.net", "p2.example.net:8443"]
  - name: backup
    hosts: ["b.example.net"]
rules:
  - proxy-name: DIRECT
    domains: ["intranet.example"]
  - proxy-name: backup
    domains: ["video.example"]
unmatched-policy:
  proxy-name: main
  detect: true
  detect-delay-ms: 25
"#;

    fn tunnel(yaml: &str) -> Tunnel {
        let config = ClientConfig::from_str(yaml).unwrap();
        let registry = Arc::new(ProxyRegistry::new(&config.proxies).unwrap());
        let transport = Arc::new(ProxyTransport::cleartext(
            Arc::new(Credentials::new("alice", "secret")),
            "/auth/".into(),
        ));
        Tunnel::new(&config, registry, transport).unwrap()
    }

    #[test]
    fn test_route_by_rule() {
        let tunnel = tunnel(CONFIG);

        let route = tunnel.route(&Target::new("wiki.intranet.example", 443)).unwrap();
        assert!(matches!(route, Route::Direct));

        let route = tunnel.route(&Target::new("cdn.video.example", 443)).unwrap();
        assert!(matches!(route, Route::Proxy(ref p) if p.name() == "backup"));
    }

    #[test]
    fn test_route_proxy_hosts_go_direct() {
        let tunnel = tunnel(CONFIG);
        let route = tunnel.route(&Target::new("p2.example.net", 8443)).unwrap();
        assert!(matches!(route, Route::Direct));
    }

    #[test]
    fn test_route_unmatched_races_until_recorded() {
        let tunnel = tunnel(CONFIG);
        let target = Target::new("www.unknown.example", 443);

        let route = tunnel.route(&target).unwrap();
        assert_eq!(format!("{:?}", route), "RACE(main, +25ms)");

        tunnel.detect_cache().record_failure("unknown.example");
        let route = tunnel.route(&target).unwrap();
        assert_eq!(format!("{:?}", route), "PROXY(main)");
    }

    #[test]
    fn test_route_unmatched_without_detect() {
        let yaml = CONFIG.replace("detect: true", "detect: false");
        let tunnel = tunnel(&yaml);
        let route = tunnel.route(&Target::new("unknown.example", 80)).unwrap();
        assert_eq!(format!("{:?}", route), "PROXY(main)");
    }

    #[tokio::test]
    async fn test_forward_direct_to_origin() {
        use http_body_util::BodyExt;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await;
        });

        // loopback literal matches no rule; DIRECT default
        let yaml = CONFIG.replace("proxy-name: main\n  detect: true", "proxy-name: DIRECT");
        let tunnel = tunnel(&yaml);
        let req = Request::builder()
            .uri(format!("http://127.0.0.1:{}/", port))
            .body(crate::outbound::empty())
            .unwrap();

        let resp = tunnel.forward(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }
}
