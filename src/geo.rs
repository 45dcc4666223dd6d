//! Geolocation cache over a MaxMind city database.
//!
//! Firewall logs are dominated by private and unroutable addresses, so a
//! null lookup result is itself a cache value: negative entries keep the
//! reader out of the hot path. The TTL is fixed, not sliding — a sliding
//! expiry would keep hot private IPs stale forever.

use crate::model::GeoData;
use lru::LruCache;
use maxminddb::{geoip2, MaxMindDBError};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const CACHE_MAX: usize = 10_000;
const ENTRY_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum GeoError {
    /// The database has not finished loading; callers must treat this as
    /// a distinct condition, not as an unresolvable address.
    #[error("geo database not loaded yet")]
    NotReady,
}

/// Seam over the city database so cache behavior is testable without a
/// binary MMDB fixture.
pub trait CityDb: Send + Sync + 'static {
    fn lookup_city(&self, ip: Ipv4Addr) -> Result<Option<GeoData>, String>;
}

impl CityDb for maxminddb::Reader<Vec<u8>> {
    fn lookup_city(&self, ip: Ipv4Addr) -> Result<Option<GeoData>, String> {
        match self.lookup::<geoip2::City>(IpAddr::V4(ip)) {
            Ok(city) => Ok(geo_from_city(&city)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn geo_from_city(c: &geoip2::City) -> Option<GeoData> {
    let loc = c.location.as_ref()?;
    let (latitude, longitude) = (loc.latitude?, loc.longitude?);
    let name_en = |names: Option<&std::collections::BTreeMap<&str, &str>>| {
        names.and_then(|n| n.get("en")).map(|s| (*s).to_string())
    };
    Some(GeoData {
        latitude,
        longitude,
        city: name_en(c.city.as_ref().and_then(|c| c.names.as_ref())),
        country_iso2: c.country.as_ref().and_then(|c| c.iso_code).map(str::to_string),
        country_name: name_en(c.country.as_ref().and_then(|c| c.names.as_ref())),
    })
}

struct CacheEntry {
    /// `None` is a legitimate value: known to be unresolvable.
    geo: Option<GeoData>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

pub struct GeoResolver {
    db: RwLock<Option<Box<dyn CityDb>>>,
    cache: Mutex<LruCache<Ipv4Addr, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    start_time: Instant,
}

impl GeoResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            db: RwLock::new(None),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_MAX).expect("nonzero capacity"),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    /// Load the database off the async runtime. A missing or unreadable
    /// database is configuration-fatal; the caller decides to exit.
    pub async fn load(self: Arc<Self>, path: PathBuf) -> anyhow::Result<()> {
        let shown = path.display().to_string();
        let started = Instant::now();
        let reader = tokio::task::spawn_blocking(move || {
            maxminddb::Reader::open_readfile(&path)
        })
        .await??;
        info!(path = %shown, elapsed_ms = started.elapsed().as_millis() as u64, "geo database loaded");
        *self.db.write().unwrap() = Some(Box::new(reader));
        Ok(())
    }

    #[cfg(test)]
    fn with_db(db: impl CityDb) -> Arc<Self> {
        let resolver = Self::new();
        *resolver.db.write().unwrap() = Some(Box::new(db));
        resolver
    }

    /// Resolve one address. Invalid keys return `Ok(None)` uncached so
    /// they cannot pollute the keyspace.
    pub fn get(&self, ip: &str) -> Result<Option<GeoData>, GeoError> {
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return Ok(None);
        };

        let mut cache = self.cache.lock().unwrap();
        // Explicit membership check: a cached None must read as a hit.
        if let Some(entry) = cache.get(&addr) {
            if entry.inserted_at.elapsed() < ENTRY_TTL {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.geo.clone());
            }
            cache.pop(&addr); // expired; fall through as a miss
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let db = self.db.read().unwrap();
        let Some(db) = db.as_ref() else {
            return Err(GeoError::NotReady);
        };
        let geo = match db.lookup_city(addr) {
            Ok(geo) => geo,
            Err(e) => {
                warn!(ip = %addr, error = %e, "geo lookup failed");
                None
            }
        };
        cache.put(addr, CacheEntry { geo: geo.clone(), inserted_at: Instant::now() });
        Ok(geo)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: self.cache.lock().unwrap().len(),
            capacity: CACHE_MAX,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    #[cfg(test)]
    fn backdate(&self, ip: &str, by: Duration) {
        let addr: Ipv4Addr = ip.parse().unwrap();
        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get_mut(&addr) {
            entry.inserted_at = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Stub database that resolves 8.8.x.x and counts reader touches.
    struct StubDb {
        touches: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CityDb for StubDb {
        fn lookup_city(&self, ip: Ipv4Addr) -> Result<Option<GeoData>, String> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("corrupt record".into());
            }
            if ip.octets()[0] == 8 {
                Ok(Some(GeoData {
                    latitude: 37.4,
                    longitude: -122.0,
                    city: Some("Mountain View".into()),
                    country_iso2: Some("US".into()),
                    country_name: Some("United States".into()),
                }))
            } else {
                Ok(None) // private ranges and bogons
            }
        }
    }

    fn stub_resolver(fail: bool) -> (Arc<GeoResolver>, Arc<AtomicUsize>) {
        let touches = Arc::new(AtomicUsize::new(0));
        let resolver = GeoResolver::with_db(StubDb { touches: touches.clone(), fail });
        (resolver, touches)
    }

    #[test]
    fn miss_then_hit_for_positive_and_negative_entries() {
        let (resolver, touches) = stub_resolver(false);

        assert!(resolver.get("8.8.8.8").unwrap().is_some()); // miss, fills
        assert!(resolver.get("8.8.8.8").unwrap().is_some()); // hit
        assert!(resolver.get("192.168.1.1").unwrap().is_none()); // miss, fills null
        assert!(resolver.get("192.168.1.1").unwrap().is_none()); // hit on null

        let stats = resolver.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        // The second calls never touched the reader.
        assert_eq!(touches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_keys_are_not_cached() {
        let (resolver, touches) = stub_resolver(false);
        for bad in ["not-an-ip", "::1", "8.8.8.8:53", "256.1.1.1", ""] {
            assert!(resolver.get(bad).unwrap().is_none());
        }
        assert_eq!(touches.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.stats().size, 0);
        // Invalid input counts as neither hit nor miss.
        assert_eq!(resolver.stats().lookups(), 0);
    }

    #[test]
    fn reader_errors_degrade_to_cached_null() {
        let (resolver, touches) = stub_resolver(true);
        assert!(resolver.get("8.8.8.8").unwrap().is_none());
        assert!(resolver.get("8.8.8.8").unwrap().is_none()); // served from cache
        assert_eq!(touches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_ready_is_an_error_not_a_null() {
        let resolver = GeoResolver::new();
        assert!(matches!(resolver.get("8.8.8.8"), Err(GeoError::NotReady)));
        // NotReady must not leave a poisoned cache entry behind.
        let stats = resolver.stats();
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn ttl_is_fixed_and_does_not_refresh_on_access() {
        let (resolver, touches) = stub_resolver(false);
        assert!(resolver.get("8.8.8.8").unwrap().is_some());
        resolver.backdate("8.8.8.8", ENTRY_TTL + Duration::from_secs(1));
        // Expired entry reads as a miss and re-resolves.
        assert!(resolver.get("8.8.8.8").unwrap().is_some());
        assert_eq!(touches.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.stats().misses, 2);
    }

    #[test]
    fn cache_never_exceeds_capacity() {
        let (resolver, _) = stub_resolver(false);
        for i in 0..(CACHE_MAX + 500) {
            let ip = format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff);
            let _ = resolver.get(&ip);
        }
        assert!(resolver.stats().size <= CACHE_MAX);
    }
}
