//! Verified-token cache with per-entry TTL

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a backend token check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedCheck {
    /// Backend check failed; do not ask again until expiry
    Failed,
    /// Token belongs to this email
    Email(String),
}

#[derive(Debug)]
struct CacheEntry {
    check: CachedCheck,
    expires: Instant,
}

/// Token -> check outcome.
///
/// `put` never overwrites a live entry; entries are swept once they pass
/// their expiry.
pub struct TokenCache {
    entries: DashMap<String, CacheEntry>,
    running: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl TokenCache {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        TokenCache {
            entries: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn get(&self, token: &str) -> Option<CachedCheck> {
        self.get_at(token, Instant::now())
    }

    pub fn get_at(&self, token: &str, now: Instant) -> Option<CachedCheck> {
        self.entries
            .get(token)
            .filter(|entry| now <= entry.expires)
            .map(|entry| entry.check.clone())
    }

    pub fn put(&self, token: &str, check: CachedCheck, ttl: Duration) {
        self.put_at(token, check, ttl, Instant::now())
    }

    pub fn put_at(&self, token: &str, check: CachedCheck, ttl: Duration, now: Instant) {
        let fresh = CacheEntry {
            check,
            expires: now + ttl,
        };
        match self.entries.entry(token.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now > occupied.get().expires {
                    occupied.insert(fresh);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
    }

    /// Drop every entry expired at `now`
    pub fn sweep_at(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.expires);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!("token cache swept {} entries", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep every [`SWEEP_INTERVAL`] until [`close`](Self::close)
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_at(Instant::now()),
                _ = shutdown_rx.recv() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn email(s: &str) -> CachedCheck {
        CachedCheck::Email(s.to_string())
    }

    #[test]
    fn test_get_and_expiry() {
        let cache = TokenCache::new();
        let t0 = Instant::now();

        cache.put_at("token", email("user"), Duration::from_secs(1), t0);
        cache.put_at("token2", email("user2"), Duration::from_secs(2), t0);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at("token", t0), Some(email("user")));
        assert_eq!(cache.get_at("token2", t0), Some(email("user2")));
        assert_eq!(cache.get_at("token3", t0), None);

        let t1 = t0 + Duration::from_millis(1500);
        assert_eq!(cache.get_at("token", t1), None);
        assert_eq!(cache.get_at("token2", t1), Some(email("user2")));

        cache.sweep_at(t1);
        assert_eq!(cache.len(), 1);

        cache.sweep_at(t0 + Duration::from_millis(2500));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_keeps_live_entry() {
        let cache = TokenCache::new();
        let t0 = Instant::now();

        cache.put_at("token", CachedCheck::Failed, Duration::from_secs(180), t0);
        cache.put_at("token", email("user"), Duration::from_secs(1800), t0);
        assert_eq!(cache.get_at("token", t0), Some(CachedCheck::Failed));

        // once expired, a new check result replaces it
        let later = t0 + Duration::from_secs(181);
        cache.put_at("token", email("user"), Duration::from_secs(1800), later);
        assert_eq!(cache.get_at("token", later), Some(email("user")));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_close() {
        let cache = Arc::new(TokenCache::new());
        cache.put("short", email("user"), Duration::from_millis(10));

        let handle = tokio::spawn({
            let cache = cache.clone();
            async move { cache.start().await }
        });

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(cache.is_running());
        assert!(cache.is_empty());

        cache.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!cache.is_running());
    }
}
