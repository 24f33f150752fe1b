//! Domain policy resolution

use crate::common::metadata::{domain_suffixes, normalize_domain};
use crate::common::Target;
use crate::config::{ClientConfig, DIRECT};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Routing decision for a destination domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'a> {
    Direct,
    /// Proxy-only through the named pool
    Proxy(&'a str),
    /// Unmatched domain: race direct against the named pool
    Detect(&'a str),
}

/// Maps domains to routing decisions.
///
/// Rules are evaluated in configuration order; a rule matches when its
/// domain set contains the domain or any of its parent suffixes.
pub struct PolicyResolver {
    /// domain suffix -> index of the first rule listing it
    suffixes: HashMap<String, usize>,
    /// rule index -> target (proxy name or `DIRECT`)
    targets: Vec<String>,
    /// proxy hostnames, never routed through a proxy
    proxy_hosts: HashSet<String>,
    unmatched: String,
    detect: bool,
}

impl PolicyResolver {
    pub fn new(config: &ClientConfig) -> Self {
        let mut suffixes = HashMap::new();
        let mut targets = Vec::with_capacity(config.rules.len());

        for (idx, rule) in config.rules.iter().enumerate() {
            targets.push(rule.proxy_name.clone());
            for domain in &rule.domains {
                suffixes.entry(normalize_domain(domain)).or_insert(idx);
            }
        }

        let proxy_hosts = config
            .proxies
            .iter()
            .flat_map(|p| p.hosts.iter())
            .filter_map(|h| Target::from_authority(h).ok())
            .map(|t| t.domain())
            .collect();

        PolicyResolver {
            suffixes,
            targets,
            proxy_hosts,
            unmatched: config.unmatched_policy.proxy_name.clone(),
            detect: config.unmatched_policy.detect,
        }
    }

    /// Resolve the routing decision for a domain
    pub fn resolve(&self, domain: &str) -> Decision<'_> {
        let domain = normalize_domain(domain);

        if self.proxy_hosts.contains(&domain) {
            return Decision::Direct;
        }

        let matched = domain_suffixes(&domain)
            .filter_map(|suffix| self.suffixes.get(suffix).copied())
            .min();

        if let Some(idx) = matched {
            let target = self.targets[idx].as_str();
            debug!("{} matched rule {} -> {}", domain, idx, target);
            return if target == DIRECT {
                Decision::Direct
            } else {
                Decision::Proxy(target)
            };
        }

        match self.unmatched.as_str() {
            DIRECT => Decision::Direct,
            name if self.detect => Decision::Detect(name),
            name => Decision::Proxy(name),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.targets.len()
    }
}
