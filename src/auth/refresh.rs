//! Background access-token refresh

use super::Credentials;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the expiry is checked
pub const CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Refresh once the token expires within this margin
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between attempts while waiting for the first access token
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccessTokenInfo {
    access_token: String,
    expires_in: u64,
}

/// Keeps [`Credentials`] supplied with a fresh access token
pub struct TokenRefresher {
    client: reqwest::Client,
    url: String,
    refresh_token: String,
    credentials: Arc<Credentials>,
    expires: Mutex<Option<Instant>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl TokenRefresher {
    /// Refresh against `https://<auth_host><auth_base_path>refresh`
    pub fn new(
        credentials: Arc<Credentials>,
        refresh_token: String,
        auth_host: &str,
        auth_base_path: &str,
    ) -> Result<Self> {
        let url = format!("https://{}{}refresh", auth_host, auth_base_path);
        Self::with_url(credentials, refresh_token, url)
    }

    pub fn with_url(
        credentials: Arc<Credentials>,
        refresh_token: String,
        url: String,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        let (shutdown, _) = watch::channel(false);

        Ok(TokenRefresher {
            client,
            url,
            refresh_token,
            credentials,
            expires: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Refresh unless the current token is still valid beyond the margin.
    ///
    /// Returns whether a refresh happened.
    pub async fn refresh_if_due(&self) -> Result<bool> {
        let due = match *self.expires.lock() {
            Some(expires) => Instant::now() + REFRESH_MARGIN >= expires,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }

    /// Exchange the refresh token for a new access token
    pub async fn refresh(&self) -> Result<Duration> {
        debug!("refreshing access token via {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest {
                refresh_token: &self.refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::auth(format!("token refresh returned {}", status)));
        }

        let info: AccessTokenInfo = response.json().await?;
        let ttl = Duration::from_secs(info.expires_in);
        self.credentials.set_token(info.access_token);
        *self.expires.lock() = Some(Instant::now() + ttl);

        info!("access token refreshed, expires in {}s", ttl.as_secs());
        Ok(ttl)
    }

    /// Retry until an access token has been obtained once.
    ///
    /// Fails only when [`close`](Self::close) is called first.
    pub async fn first_refresh(&self) -> Result<Duration> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                return Err(Error::auth("closed before the first token refresh"));
            }
            match self.refresh().await {
                Ok(ttl) => return Ok(ttl),
                Err(e) => warn!("initial token refresh failed, retrying: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(INITIAL_RETRY_DELAY) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Run the refresh loop until [`close`](Self::close)
    pub async fn start(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut ticker = tokio::time::interval(CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_if_due().await {
                        warn!("token refresh failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}
