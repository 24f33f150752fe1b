//! Proxy host latency prober

use super::{ProxyRegistry, UNREACHABLE};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One authenticated health request against a proxy host
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &str) -> Result<()>;
}

/// Periodically measures every proxy host and publishes the results
pub struct LatencyProber {
    probe: Arc<dyn HealthProbe>,
    registry: Arc<ProxyRegistry>,
    interval: Duration,
    timeout: Duration,
    running: AtomicBool,
    /// Latched on close, so a close before `start` still stops the loop
    shutdown: watch::Sender<bool>,
}

impl LatencyProber {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        registry: Arc<ProxyRegistry>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        LatencyProber {
            probe,
            registry,
            interval,
            timeout,
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Measure all hosts once and publish to every pool
    pub async fn check(&self) -> HashMap<String, Duration> {
        let hosts = self.registry.all_hosts();

        let futures: Vec<_> = hosts
            .into_iter()
            .map(|host| async move {
                let latency = self.measure(&host).await;
                (host, latency)
            })
            .collect();

        let measurements: HashMap<String, Duration> =
            futures::future::join_all(futures).await.into_iter().collect();

        for (host, latency) in &measurements {
            if *latency == UNREACHABLE {
                debug!("{}: unreachable", host);
            } else {
                debug!("{}: {}ms", host, latency.as_millis());
            }
        }

        for proxy in self.registry.iter() {
            proxy.publish(&measurements);
        }

        measurements
    }

    /// Warm the pooled connection, then time a second probe
    async fn measure(&self, host: &str) -> Duration {
        if let Ok(Err(e)) = timeout(self.timeout, self.probe.probe(host)).await {
            debug!("warm-up probe to {} failed: {}", host, e);
        }

        let start = Instant::now();
        match timeout(self.timeout, self.probe.probe(host)).await {
            Ok(Ok(())) => start.elapsed(),
            Ok(Err(e)) => {
                warn!("health probe to {} failed: {}", host, e);
                UNREACHABLE
            }
            Err(_) => {
                warn!("health probe to {} timed out after {:?}", host, self.timeout);
                UNREACHABLE
            }
        }
    }

    /// Run the probe loop until [`close`](Self::close); the first round
    /// starts immediately.
    pub async fn start(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            "latency prober started ({} hosts, every {:?})",
            self.registry.all_hosts().len(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, SelectPolicy};
    use crate::Error;
    use std::sync::atomic::AtomicUsize;

    /// Delay per host; `None` fails the probe
    struct FakeProbe {
        delays: HashMap<String, Option<Duration>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, host: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.delays.get(host).copied().flatten() {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                None => Err(Error::proxy("refused")),
            }
        }
    }

    fn registry() -> Arc<ProxyRegistry> {
        Arc::new(
            ProxyRegistry::new(&[ProxyConfig {
                name: "main".to_string(),
                hosts: vec!["a.net".into(), "b.net".into(), "c.net".into(), "d.net".into()],
                select_policy: SelectPolicy::Latency,
            }])
            .unwrap(),
        )
    }

    fn fake(delays: &[(&str, Option<u64>)]) -> Arc<FakeProbe> {
        Arc::new(FakeProbe {
            delays: delays
                .iter()
                .map(|(h, d)| (h.to_string(), d.map(Duration::from_millis)))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_check_publishes_ranked_hosts() {
        let probe = fake(&[
            ("a.net:443", Some(60)),
            ("b.net:443", Some(5)),
            ("c.net:443", None),
            ("d.net:443", Some(1000)),
        ]);
        let registry = registry();
        let prober = LatencyProber::new(
            probe.clone(),
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_millis(300),
        );

        let measurements = prober.check().await;
        assert_eq!(measurements["c.net:443"], UNREACHABLE);
        assert_eq!(measurements["d.net:443"], UNREACHABLE);
        assert!(measurements["b.net:443"] < measurements["a.net:443"]);
        // warm-up plus timed probe per host
        assert_eq!(probe.calls.load(Ordering::SeqCst), 8);

        let proxy = registry.get("main").unwrap();
        assert_eq!(proxy.snapshot().ranked, vec!["b.net:443", "a.net:443"]);
        assert_eq!(proxy.select().unwrap(), "b.net:443");
    }

    #[tokio::test]
    async fn test_all_failed_keeps_static_hosts() {
        let registry = registry();
        let prober = LatencyProber::new(
            fake(&[]),
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        prober.check().await;

        let proxy = registry.get("main").unwrap();
        assert!(proxy.snapshot().ranked.is_empty());
        assert_eq!(proxy.select().unwrap(), "a.net:443");
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let probe = fake(&[("a.net:443", Some(1))]);
        let prober = Arc::new(LatencyProber::new(
            probe.clone(),
            registry(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        ));

        let handle = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.start().await })
        };

        for _ in 0..100 {
            if probe.calls.load(Ordering::SeqCst) > 0 && prober.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(prober.is_running());

        prober.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!prober.is_running());
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let probe = fake(&[("a.net:443", Some(1))]);
        let prober = LatencyProber::new(
            probe.clone(),
            registry(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );

        prober.close();
        tokio::time::timeout(Duration::from_secs(2), prober.start())
            .await
            .unwrap();
        assert!(!prober.is_running());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
