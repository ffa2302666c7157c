//! Per-host certificate cache.
//!
//! Minting an ECDSA leaf is cheap but not free; a busy proxy sees the same
//! hosts over and over. Entries expire after a TTL of inactivity, with a
//! hard size cap enforced by evicting oldest-first down to 75% capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::proxy::ca::{CaError, CertAuthority, MintedCert};

const DEFAULT_MAX_SIZE: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// How often the background eviction pass runs.
pub const EVICTION_PERIOD: Duration = Duration::from_secs(300);

struct CachedCert {
    cert: Arc<MintedCert>,
    /// Seconds since the cache epoch; bumped by readers without taking the
    /// write lock.
    last_used: AtomicU64,
}

/// Thread-safe host → certificate cache with TTL + LRU eviction.
///
/// Readers share the read lock; a miss mints under the write lock after a
/// re-check, so concurrent lookups for the same host invoke the generator
/// exactly once.
pub struct CertCache {
    ca: CertAuthority,
    certs: RwLock<HashMap<String, CachedCert>>,
    epoch: Instant,
    max_size: usize,
    ttl: Duration,
}

impl CertCache {
    pub fn new(ca: CertAuthority) -> Self {
        Self::with_limits(ca, DEFAULT_MAX_SIZE, DEFAULT_TTL)
    }

    pub fn with_limits(ca: CertAuthority, max_size: usize, ttl: Duration) -> Self {
        Self {
            ca,
            certs: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            max_size,
            ttl,
        }
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Return the cached certificate for `host`, minting on first contact.
    pub fn get_cert(&self, host: &str) -> Result<Arc<MintedCert>, CaError> {
        {
            let certs = self.certs.read().expect("cert cache lock poisoned");
            if let Some(entry) = certs.get(host) {
                entry.last_used.store(self.now_secs(), Ordering::Relaxed);
                return Ok(entry.cert.clone());
            }
        }

        let mut certs = self.certs.write().expect("cert cache lock poisoned");
        // Another task may have minted while we waited for the write lock.
        if let Some(entry) = certs.get(host) {
            entry.last_used.store(self.now_secs(), Ordering::Relaxed);
            return Ok(entry.cert.clone());
        }

        let cert = Arc::new(self.ca.mint_leaf(host)?);
        certs.insert(
            host.to_string(),
            CachedCert {
                cert: cert.clone(),
                last_used: AtomicU64::new(self.now_secs()),
            },
        );

        tracing::debug!(host, cached = certs.len(), "minted leaf certificate");
        Ok(cert)
    }

    pub fn size(&self) -> usize {
        self.certs.read().expect("cert cache lock poisoned").len()
    }

    pub fn clear(&self) {
        self.certs.write().expect("cert cache lock poisoned").clear();
    }

    /// One eviction pass: drop TTL-expired entries, then enforce the size
    /// cap by evicting oldest entries down to 75% capacity.
    pub fn evict(&self) {
        let mut certs = self.certs.write().expect("cert cache lock poisoned");
        let now = self.now_secs();
        let ttl_secs = self.ttl.as_secs();

        certs.retain(|_, entry| now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) <= ttl_secs);

        if certs.len() > self.max_size {
            let target = self.max_size * 3 / 4;
            let mut entries: Vec<(String, u64)> = certs
                .iter()
                .map(|(host, entry)| (host.clone(), entry.last_used.load(Ordering::Relaxed)))
                .collect();
            entries.sort_by_key(|(_, last_used)| *last_used);

            for (host, _) in entries {
                if certs.len() <= target {
                    break;
                }
                certs.remove(&host);
            }
        }
    }

    /// Run the periodic eviction pass until shutdown.
    pub async fn run_eviction(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(EVICTION_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.evict(),
                _ = shutdown.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_cache(max_size: usize, ttl: Duration) -> (CertCache, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "stronghold-certcache-{}-{max_size}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let ca = CertAuthority::load_or_create(&dir).unwrap();
        (CertCache::with_limits(ca, max_size, ttl), dir)
    }

    #[test]
    fn test_get_cert_caches_results() {
        let (cache, dir) = test_cache(100, Duration::from_secs(3600));

        let cert1 = cache.get_cert("example.com").unwrap();
        let cert2 = cache.get_cert("example.com").unwrap();
        assert!(Arc::ptr_eq(&cert1, &cert2));

        let cert3 = cache.get_cert("other.com").unwrap();
        assert!(!Arc::ptr_eq(&cert1, &cert3));
        assert_eq!(cache.size(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_ttl_eviction() {
        let (cache, dir) = test_cache(100, Duration::from_secs(0));

        for host in ["a.com", "b.com", "c.com"] {
            cache.get_cert(host).unwrap();
        }
        assert_eq!(cache.size(), 3);

        std::thread::sleep(Duration::from_millis(1100));
        cache.evict();
        assert_eq!(cache.size(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_size_cap_eviction() {
        let (cache, dir) = test_cache(8, Duration::from_secs(3600));

        for i in 0..12 {
            cache.get_cert(&format!("host-{i}.example.com")).unwrap();
        }
        assert_eq!(cache.size(), 12);

        cache.evict();
        // Down to 75% of the cap
        assert!(cache.size() <= 6, "expected <= 6, got {}", cache.size());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_concurrent_single_flight() {
        let (cache, dir) = test_cache(100, Duration::from_secs(3600));
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_cert("same-host.com").unwrap())
            })
            .collect();

        let certs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for cert in &certs[1..] {
            assert!(Arc::ptr_eq(&certs[0], cert));
        }
        assert_eq!(cache.size(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
