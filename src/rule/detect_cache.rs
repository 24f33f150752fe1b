//! Negative cache of domains that failed direct access

use crate::common::metadata::{domain_suffixes, normalize_domain, registrable_domain};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default upper bound on cached domains
pub const DEFAULT_MAX_ENTRIES: usize = 4096;

type Table = HashMap<String, Instant>;

/// Domains whose direct probe recently failed.
///
/// Writers rebuild the table and swap it in whole; readers clone the
/// current `Arc` and never observe a partially built table.
pub struct DetectionCache {
    expiry: Duration,
    max_entries: usize,
    table: RwLock<Arc<Table>>,
}

impl DetectionCache {
    pub fn new(expiry: Duration) -> Self {
        Self::with_capacity(expiry, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(expiry: Duration, max_entries: usize) -> Self {
        DetectionCache {
            expiry,
            max_entries: max_entries.max(1),
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn is_failing(&self, domain: &str) -> bool {
        self.is_failing_at(domain, Instant::now())
    }

    pub fn is_failing_at(&self, domain: &str, now: Instant) -> bool {
        let table = self.table.read().clone();
        let domain = normalize_domain(domain);
        let failing = domain_suffixes(&domain).any(|suffix| {
            table
                .get(suffix)
                .map_or(false, |failed_at| self.is_live(*failed_at, now))
        });
        failing
    }

    pub fn record_failure(&self, domain: &str) {
        self.record_failure_at(domain, Instant::now())
    }

    pub fn record_failure_at(&self, domain: &str, now: Instant) {
        let domain = normalize_domain(domain);
        let key = registrable_domain(&domain).to_string();

        let mut guard = self.table.write();
        let mut live: Vec<(String, Instant)> = guard
            .iter()
            .filter(|(k, failed_at)| **k != key && self.is_live(**failed_at, now))
            .map(|(k, failed_at)| (k.clone(), *failed_at))
            .collect();

        if live.len() >= self.max_entries {
            live.sort_by(|a, b| b.1.cmp(&a.1));
            live.truncate(self.max_entries - 1);
        }

        let mut table: Table = live.into_iter().collect();
        table.insert(key.clone(), now);
        *guard = Arc::new(table);

        debug!("direct access to {} marked failing", key);
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_live(&self, failed_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(failed_at) < self.expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(600);

    #[test]
    fn test_record_truncates_to_two_labels() {
        let cache = DetectionCache::new(WINDOW);
        let t0 = Instant::now();
        cache.record_failure_at("img.cdn.example.com", t0);

        assert!(cache.is_failing_at("example.com", t0));
        assert!(cache.is_failing_at("www.example.com", t0));
        assert!(cache.is_failing_at("IMG.CDN.Example.com", t0));
        assert!(!cache.is_failing_at("example.org", t0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expiry_boundary() {
        let cache = DetectionCache::new(WINDOW);
        let t0 = Instant::now();
        let eps = Duration::from_millis(1);
        cache.record_failure_at("example.com", t0);

        assert!(cache.is_failing_at("a.example.com", t0 + WINDOW - eps));
        assert!(!cache.is_failing_at("a.example.com", t0 + WINDOW));
        assert!(!cache.is_failing_at("a.example.com", t0 + WINDOW + eps));
    }

    #[test]
    fn test_rebuild_drops_expired_entries() {
        let cache = DetectionCache::new(WINDOW);
        let t0 = Instant::now();
        cache.record_failure_at("old.com", t0);
        cache.record_failure_at("new.com", t0 + WINDOW + Duration::from_secs(1));

        assert_eq!(cache.len(), 1);
        assert!(cache.is_failing_at("new.com", t0 + WINDOW + Duration::from_secs(2)));
    }

    #[test]
    fn test_refresh_existing_entry() {
        let cache = DetectionCache::new(WINDOW);
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(300);
        cache.record_failure_at("example.com", t0);
        cache.record_failure_at("www.example.com", later);

        assert_eq!(cache.len(), 1);
        assert!(cache.is_failing_at("example.com", t0 + WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let cache = DetectionCache::with_capacity(WINDOW, 2);
        let t0 = Instant::now();
        cache.record_failure_at("a.com", t0);
        cache.record_failure_at("b.com", t0 + Duration::from_secs(1));
        cache.record_failure_at("c.com", t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_secs(3);
        assert_eq!(cache.len(), 2);
        assert!(!cache.is_failing_at("a.com", now));
        assert!(cache.is_failing_at("b.com", now));
        assert!(cache.is_failing_at("c.com", now));
    }

    #[test]
    fn test_ip_literal_is_exact() {
        let cache = DetectionCache::new(WINDOW);
        let t0 = Instant::now();
        cache.record_failure_at("1.2.3.4", t0);

        assert!(cache.is_failing_at("1.2.3.4", t0));
        assert!(!cache.is_failing_at("9.9.3.4", t0));
        assert!(!cache.is_failing_at("3.4", t0));
    }

    #[test]
    fn test_single_label_domain() {
        let cache = DetectionCache::new(WINDOW);
        let t0 = Instant::now();
        cache.record_failure_at("localhost", t0);
        assert!(cache.is_failing_at("localhost", t0));
        assert!(!cache.is_empty());
    }
}
