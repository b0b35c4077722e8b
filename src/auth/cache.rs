//! Authentication result cache.
//!
//! Two independent maps, one per owner side, hold `(result, expires_at)`
//! entries. An expired entry reads as a miss; [`AuthCache::sweep`] removes
//! expired entries shard by shard so lookups are never blocked for longer
//! than one shard scan.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::AuthResult;
use crate::config::AuthCacheConfig;
use crate::model::{CredOwner, OwnerKind};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = later(*now, to_delta(by));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn later(at: DateTime<Utc>, by: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    owner_kind: OwnerKind,
    owner_id: i64,
    kind: String,
    value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: AuthResult,
    expires_at: DateTime<Utc>,
}

/// Time-bounded cache of authentication results.
pub struct AuthCache {
    clock: Arc<dyn Clock>,
    expiration: TimeDelta,
    local: DashMap<CacheKey, CacheEntry>,
    remote: DashMap<CacheKey, CacheEntry>,
}

impl AuthCache {
    pub fn new(clock: Arc<dyn Clock>, expiration: Duration) -> Self {
        Self {
            clock,
            expiration: to_delta(expiration),
            local: DashMap::new(),
            remote: DashMap::new(),
        }
    }

    /// A wall-clock cache using the configured expiration window.
    pub fn from_config(config: &AuthCacheConfig) -> Self {
        Self::new(
            Arc::new(SystemClock),
            Duration::from_millis(config.expiration_ms),
        )
    }

    fn side(&self, owner: CredOwner) -> &DashMap<CacheKey, CacheEntry> {
        if owner.is_local() {
            &self.local
        } else {
            &self.remote
        }
    }

    fn key(owner: CredOwner, kind: &str, value: &[u8]) -> CacheKey {
        CacheKey {
            owner_kind: owner.kind,
            owner_id: owner.id,
            kind: kind.to_string(),
            value: value.to_vec(),
        }
    }

    /// The cached result, unless absent or expired.
    pub fn get(&self, owner: CredOwner, kind: &str, value: &[u8]) -> Option<AuthResult> {
        let now = self.clock.now();
        self.side(owner)
            .get(&Self::key(owner, kind, value))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.result.clone())
    }

    /// Store `result`, expiring one window from now.
    pub fn insert(&self, owner: CredOwner, kind: &str, value: &[u8], result: AuthResult) {
        let expires_at = later(self.clock.now(), self.expiration);
        self.side(owner)
            .insert(Self::key(owner, kind, value), CacheEntry { result, expires_at });
    }

    /// Remove every expired entry from both sides. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        self.remote.retain(|_, entry| entry.expires_at > now);

        let evicted = before.saturating_sub(self.len());
        if evicted > 0 {
            debug!(evicted, "Swept expired authentication results");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }

    /// Sweep every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    trace!("Authentication cache dropped, sweeper exiting");
                    break;
                };
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (Arc<ManualClock>, Arc<AuthCache>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(AuthCache::new(clock.clone(), Duration::from_secs(3)));
        (clock, cache)
    }

    #[test]
    fn test_hit_then_expiry() {
        let (clock, cache) = cache();
        let owner = CredOwner::local_account(1);

        cache.insert(owner, "password", b"sesame", AuthResult::success());
        clock.advance(Duration::from_secs(2));
        assert_eq!(
            cache.get(owner, "password", b"sesame"),
            Some(AuthResult::success())
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(owner, "password", b"sesame"), None);
    }

    #[test]
    fn test_sides_do_not_collide() {
        let (_clock, cache) = cache();

        cache.insert(
            CredOwner::local_account(5),
            "password",
            b"x",
            AuthResult::success(),
        );
        assert!(cache.get(CredOwner::remote_account(5), "password", b"x").is_none());
        assert!(cache.get(CredOwner::local_agent(5), "password", b"x").is_none());
        assert!(cache.get(CredOwner::local_account(5), "password", b"y").is_none());
        assert_eq!(cache.local_len(), 1);
        assert_eq!(cache.remote_len(), 0);
    }

    #[test]
    fn test_sweep_evicts_expired_only() {
        let (clock, cache) = cache();

        cache.insert(
            CredOwner::local_account(1),
            "password",
            b"old",
            AuthResult::failure("invalid password"),
        );
        cache.insert(
            CredOwner::remote_agent(1),
            "password",
            b"old",
            AuthResult::success(),
        );
        clock.advance(Duration::from_secs(2));
        cache.insert(
            CredOwner::local_account(2),
            "password",
            b"new",
            AuthResult::success(),
        );

        clock.advance(Duration::from_millis(1500));
        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(CredOwner::local_account(2), "password", b"new").is_some());
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let (clock, cache) = cache();
        let handle = cache.spawn_sweeper(Duration::from_millis(20));

        cache.insert(
            CredOwner::local_account(1),
            "password",
            b"sesame",
            AuthResult::success(),
        );
        clock.advance(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit once the cache is dropped")
            .unwrap();
    }
}
