//! Remote proxy pools
//!
//! A [`Proxy`] is a named pool of `host:port` endpoints. The latency prober
//! publishes measurements into each pool as one immutable snapshot, and
//! request handlers pick a host from whatever snapshot is current.

mod prober;
pub mod selector;

pub use prober::{HealthProbe, LatencyProber, DEFAULT_PROBE_TIMEOUT};

use crate::common::Target;
use crate::config::{ProxyConfig, SelectPolicy};
use crate::{Error, Result};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Latency recorded for hosts that failed or timed out
pub const UNREACHABLE: Duration = Duration::MAX;

/// Prober output for one pool
#[derive(Debug, Clone, Default)]
pub struct LatencySnapshot {
    /// Reachable hosts, ascending latency
    pub ranked: Vec<String>,
    /// Raw measurements, unreachable hosts included
    pub latencies: HashMap<String, Duration>,
}

pub struct Proxy {
    name: String,
    hosts: Vec<String>,
    policy: SelectPolicy,
    state: RwLock<Arc<LatencySnapshot>>,
}

impl Proxy {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .map(|h| Target::from_authority(h).map(|t| t.to_string()))
            .collect::<Result<Vec<_>>>()?;
        if hosts.is_empty() {
            return Err(Error::config(format!("proxy {} has no hosts", config.name)));
        }

        Ok(Proxy {
            name: config.name.clone(),
            hosts,
            policy: config.select_policy,
            state: RwLock::new(Arc::new(LatencySnapshot::default())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static host list (`host:port`)
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn policy(&self) -> SelectPolicy {
        self.policy
    }

    pub fn snapshot(&self) -> Arc<LatencySnapshot> {
        self.state.read().clone()
    }

    /// Replace the snapshot with fresh measurements.
    ///
    /// Hosts missing from `measurements` count as unreachable.
    pub fn publish(&self, measurements: &HashMap<String, Duration>) {
        let latencies: HashMap<String, Duration> = self
            .hosts
            .iter()
            .map(|h| (h.clone(), measurements.get(h).copied().unwrap_or(UNREACHABLE)))
            .collect();

        let mut ranked: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| latencies[*h] != UNREACHABLE)
            .cloned()
            .collect();
        ranked.sort_by_key(|h| latencies[h]);

        *self.state.write() = Arc::new(LatencySnapshot { ranked, latencies });
    }

    pub fn select(&self) -> Result<String> {
        self.select_with(&mut rand::thread_rng())
    }

    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<String> {
        let snapshot = self.snapshot();
        selector::select(
            self.policy,
            &snapshot.ranked,
            &snapshot.latencies,
            &self.hosts,
            rng,
        )
        .map(str::to_string)
        .ok_or_else(|| Error::proxy(format!("proxy {} has no hosts", self.name)))
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("hosts", &self.hosts)
            .field("policy", &self.policy)
            .finish()
    }
}

/// All configured pools, by name
pub struct ProxyRegistry {
    proxies: HashMap<String, Arc<Proxy>>,
}

impl ProxyRegistry {
    pub fn new(configs: &[ProxyConfig]) -> Result<Self> {
        let mut proxies = HashMap::new();
        for config in configs {
            proxies.insert(config.name.clone(), Arc::new(Proxy::new(config)?));
        }
        Ok(ProxyRegistry { proxies })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Proxy>> {
        self.proxies.values()
    }

    /// Distinct hosts across every pool
    pub fn all_hosts(&self) -> Vec<String> {
        self.proxies
            .values()
            .flat_map(|p| p.hosts.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}
