//! shp-rust - secure HTTP proxy
//!
//! Two agents in one crate:
//! - **client**: local HTTP proxy that routes each destination domain
//!   direct, through an authenticated remote proxy pool, or races both
//! - **server**: HTTPS (HTTP/1.1 + HTTP/2) endpoint that authenticates
//!   `Proxy-Authorization` and serves CONNECT tunnels and forwarded requests
//!
//! # Architecture
//!
//! ```text
//!   browser
//!      |
//! +----v-------+     +-----------+     +--------------+
//! |  inbound/  +---->+  tunnel/  +---->+    rule/     |
//! | (listener) |     | (racer,   |     | (policy,     |
//! +------------+     |  relay)   |     |  detection)  |
//!                    +-----+-----+     +--------------+
//!                          |
//!        +-----------------+-----------------+
//!        |                                   |
//! +------v------+                     +------v------+
//! |  outbound/  +<--------------------+   proxy/    |
//! | (direct,    |   health probes     | (pools,     |
//! |  h2 tunnel) |                     |  prober)    |
//! +------+------+                     +-------------+
//!        |
//! +------v------+
//! |   server/   |  auth, CONNECT, forward
//! +-------------+
//! ```

pub mod auth;
pub mod common;
pub mod config;
pub mod inbound;
pub mod outbound;
pub mod proxy;
pub mod rule;
pub mod server;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::{ClientConfig, ServerConfig};

use inbound::InboundListener;
use std::sync::Arc;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client agent: local proxy listener plus its background loops
pub struct Client {
    tunnel: Arc<tunnel::Tunnel>,
    prober: Arc<proxy::LatencyProber>,
    refresher: Option<Arc<auth::TokenRefresher>>,
    listener: Arc<inbound::HttpListener>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        info!("Initializing shp-rust client v{}", VERSION);

        let credentials = Arc::new(auth::Credentials::new(
            config.username.clone(),
            config.token.clone(),
        ));

        let registry = Arc::new(proxy::ProxyRegistry::new(&config.proxies)?);
        info!("Loaded {} proxies", registry.len());

        let transport = Arc::new(outbound::ProxyTransport::new(
            credentials.clone(),
            config.auth_base_path.clone(),
            config.skip_cert_verify,
        )?);

        let prober = Arc::new(proxy::LatencyProber::new(
            transport.clone(),
            registry.clone(),
            config.latency_test_interval(),
            proxy::DEFAULT_PROBE_TIMEOUT,
        ));

        let refresher = match &config.refresh_token {
            Some(refresh_token) => {
                let auth_host = match &config.auth_host {
                    Some(host) => host.clone(),
                    None => config
                        .proxies
                        .iter()
                        .flat_map(|p| p.hosts.iter())
                        .next()
                        .cloned()
                        .ok_or_else(|| Error::config("no host for token refresh"))?,
                };
                Some(Arc::new(auth::TokenRefresher::new(
                    credentials,
                    refresh_token.clone(),
                    &auth_host,
                    &config.auth_base_path,
                )?))
            }
            None => None,
        };

        let tunnel = Arc::new(tunnel::Tunnel::new(&config, registry, transport)?);
        let listener = Arc::new(inbound::HttpListener::new(config.listen.clone(), tunnel.clone()));

        Ok(Client {
            tunnel,
            prober,
            refresher,
            listener,
        })
    }

    /// Block until the access token has been obtained once, when it comes
    /// from a refresh token
    pub async fn wait_for_credentials(&self) -> Result<()> {
        if let Some(refresher) = &self.refresher {
            info!("Waiting for the first access token...");
            refresher.first_refresh().await?;
        }
        Ok(())
    }

    /// Run until ctrl-c
    pub async fn run(&self) -> Result<()> {
        info!("Starting client...");

        tokio::select! {
            ready = self.wait_for_credentials() => ready?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received shutdown signal");
                return Ok(());
            }
        }

        let mut handles = Vec::new();

        if let Some(refresher) = &self.refresher {
            let refresher = refresher.clone();
            handles.push(tokio::spawn(async move { refresher.start().await }));
        }

        let prober = self.prober.clone();
        handles.push(tokio::spawn(async move { prober.start().await }));

        let listener = self.listener.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = listener.start().await {
                warn!("{} listener error: {}", listener.name(), e);
            }
        }));

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        self.listener.stop().await?;
        self.prober.close();
        if let Some(refresher) = &self.refresher {
            refresher.close();
        }
        for handle in handles {
            handle.abort();
        }

        info!("Client stopped");
        Ok(())
    }

    pub fn tunnel(&self) -> &Arc<tunnel::Tunnel> {
        &self.tunnel
    }
}

/// Server agent: TLS listener plus the token cache sweeper
pub struct Server {
    token_cache: Arc<server::TokenCache>,
    listener: Arc<server::TlsListener>,
}

impl Server {
    /// Static credentials only; unauthenticated traffic gets 404
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_backends(config, None, Arc::new(server::NotFound))
    }

    pub fn with_backends(
        config: ServerConfig,
        verifier: Option<Arc<dyn server::TokenVerifier>>,
        fallback: Arc<dyn server::FallbackHandler>,
    ) -> Result<Self> {
        info!("Initializing shp-rust server v{}", VERSION);

        let token_cache = Arc::new(server::TokenCache::new());
        let authenticator = Arc::new(server::Authenticator::new(
            config.auth.clone(),
            token_cache.clone(),
            verifier,
        ));
        info!("Loaded {} static users", config.auth.len());

        let service = Arc::new(server::ProxyService::new(
            authenticator,
            fallback,
            &config.auth_base_path,
            config.hostname.clone(),
        )?);
        let listener = Arc::new(server::TlsListener::from_pem(
            &config.listen,
            &config.cert_file,
            &config.key_file,
            service,
        )?);

        Ok(Server {
            token_cache,
            listener,
        })
    }

    /// Run until ctrl-c
    pub async fn run(&self) -> Result<()> {
        info!("Starting server...");

        let token_cache = self.token_cache.clone();
        let sweeper = tokio::spawn(async move { token_cache.start().await });

        let listener = self.listener.clone();
        let serving = tokio::spawn(async move {
            if let Err(e) = listener.start().await {
                warn!("{} listener error: {}", listener.name(), e);
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        self.listener.stop().await?;
        self.token_cache.close();
        sweeper.abort();
        serving.abort();

        info!("Server stopped");
        Ok(())
    }
}
