//! Connection racer
//!
//! Launches the direct and/or proxy dial for a destination, commits to the
//! first success and closes whatever arrives later. Client bytes are only
//! ever written to the committed stream.

use crate::common::Target;
use crate::outbound::RemoteStream;
use crate::proxy::Proxy;
use crate::rule::DetectionCache;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Size of the buffer holding the client's first read
pub const FIRST_READ_BUFFER_SIZE: usize = 32 * 1024;

/// How a destination may be reached
#[derive(Clone)]
pub enum Route {
    Direct,
    Proxy(Arc<Proxy>),
    /// Race direct against the proxy, the proxy starting after `delay`
    Race { proxy: Arc<Proxy>, delay: Duration },
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("DIRECT"),
            Route::Proxy(proxy) => write!(f, "PROXY({})", proxy.name()),
            Route::Race { proxy, delay } => {
                write!(f, "RACE({}, +{}ms)", proxy.name(), delay.as_millis())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Direct,
    Proxy,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Direct => f.write_str("direct"),
            PathKind::Proxy => f.write_str("proxy"),
        }
    }
}

/// Dials the two kinds of path
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial_direct(&self, target: &Target) -> Result<RemoteStream>;

    async fn dial_proxy(&self, proxy: &Proxy, target: &Target) -> Result<RemoteStream>;
}

/// Outcome of one launched attempt
struct AttemptResult {
    path: PathKind,
    outcome: Result<RemoteStream>,
}

/// The first successful attempt, not yet carrying client bytes
#[derive(Debug)]
pub struct Winner {
    pub path: PathKind,
    stream: RemoteStream,
}

impl Winner {
    /// Forward the client's first read to this stream only.
    ///
    /// A read error closes the stream. A read that times out commits with
    /// nothing written, so protocols where the server speaks first work.
    pub async fn commit<C>(mut self, client: &mut C, first_read_timeout: Duration) -> Result<RemoteStream>
    where
        C: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; FIRST_READ_BUFFER_SIZE];
        match timeout(first_read_timeout, client.read(&mut buf)).await {
            Ok(Ok(n)) => {
                if n > 0 {
                    self.stream.write_all(&buf[..n]).await?;
                }
                trace!("committed {} stream with {} bytes", self.path, n);
                Ok(self.stream)
            }
            Ok(Err(e)) => {
                self.stream.close();
                Err(Error::FirstRead(e))
            }
            Err(_) => {
                debug!("no client bytes within {:?}, committing empty", first_read_timeout);
                Ok(self.stream)
            }
        }
    }

    pub fn into_stream(self) -> RemoteStream {
        self.stream
    }
}

pub struct Racer {
    connector: Arc<dyn Connector>,
    detect_cache: Arc<DetectionCache>,
}

impl Racer {
    pub fn new(connector: Arc<dyn Connector>, detect_cache: Arc<DetectionCache>) -> Self {
        Racer {
            connector,
            detect_cache,
        }
    }

    /// Launch the attempts `route` allows and return the first success
    pub async fn race(&self, target: &Target, route: &Route) -> Result<Winner> {
        let (tx, mut rx) = mpsc::channel::<AttemptResult>(2);
        let (settled_tx, settled_rx) = watch::channel(false);
        let mut launched = 0usize;

        if !matches!(route, Route::Proxy(_)) {
            launched += 1;
            let detecting = matches!(route, Route::Race { .. });
            let connector = self.connector.clone();
            let cache = self.detect_cache.clone();
            let target = target.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let outcome = connector.dial_direct(&target).await;
                if let Err(e) = &outcome {
                    debug!("direct dial to {} failed: {}", target, e);
                    if detecting {
                        cache.record_failure(&target.domain());
                    }
                }
                let _ = tx
                    .send(AttemptResult {
                        path: PathKind::Direct,
                        outcome,
                    })
                    .await;
            });
        }

        let proxy_attempt = match route {
            Route::Direct => None,
            Route::Proxy(proxy) => Some((proxy.clone(), Duration::ZERO)),
            Route::Race { proxy, delay } => Some((proxy.clone(), *delay)),
        };

        if let Some((proxy, delay)) = proxy_attempt {
            launched += 1;
            let connector = self.connector.clone();
            let target = target.clone();
            let mut settled = settled_rx;
            let tx = tx.clone();

            tokio::spawn(async move {
                let outcome = if delay.is_zero() {
                    connector.dial_proxy(&proxy, &target).await
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => connector.dial_proxy(&proxy, &target).await,
                        _ = async { let _ = settled.wait_for(|done| *done).await; } => {
                            Err(Error::proxy("race already settled"))
                        }
                    }
                };
                if let Err(e) = &outcome {
                    debug!("proxy dial to {} via {} failed: {}", target, proxy.name(), e);
                }
                let _ = tx
                    .send(AttemptResult {
                        path: PathKind::Proxy,
                        outcome,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut remaining = launched;
        while let Some(result) = rx.recv().await {
            remaining -= 1;
            if let Ok(stream) = result.outcome {
                let _ = settled_tx.send(true);
                if remaining > 0 {
                    tokio::spawn(drain_losers(rx));
                }
                debug!("{} won the race to {}", result.path, target);
                return Ok(Winner {
                    path: result.path,
                    stream,
                });
            }
        }

        Err(Error::no_route(target.to_string()))
    }
}

/// Close streams from attempts that finished after the winner
async fn drain_losers(mut rx: mpsc::Receiver<AttemptResult>) {
    while let Some(late) = rx.recv().await {
        if let Ok(stream) = late.outcome {
            debug!("closing late {} stream", late.path);
            stream.close();
        }
    }
}
