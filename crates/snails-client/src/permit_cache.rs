//! In-memory cache of signed permits.
//!
//! Entries are keyed by `"{address}-{PERMIT_TYPE}"` and live for one hour.
//! Expired entries disappear on the next read of their key and on the
//! periodic sweep. The sweep task starts with the first insert and stops
//! by itself once the cache is empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use snails_shared::constants::{PERMIT_SWEEP_SECS, PERMIT_TTL_SECS};
use snails_shared::{Address, Permit, PermitType};

/// Source of wall-clock time for expiry decisions.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct CachedPermit {
    pub permit: Permit,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    permits: HashMap<String, CachedPermit>,
    sweeping: bool,
}

pub struct PermitCache {
    entries: Arc<Mutex<Entries>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    sweep_interval: Duration,
}

fn cache_key(address: &Address, permit_type: PermitType) -> String {
    format!("{}-{}", address, permit_type.as_str())
}

fn remaining(cached: &CachedPermit, now: DateTime<Utc>) -> Option<Duration> {
    (cached.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
}

impl PermitCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            clock,
            ttl: Duration::from_secs(PERMIT_TTL_SECS),
            sweep_interval: Duration::from_secs(PERMIT_SWEEP_SECS),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached permit for `address`, `None` if absent or expired.
    pub fn get_permit(&self, address: &Address, permit_type: PermitType) -> Option<Permit> {
        let key = cache_key(address, permit_type);
        let now = self.clock.now();
        let mut entries = self.lock();

        let cached = entries.permits.get(&key)?;
        if now > cached.expires_at {
            entries.permits.remove(&key);
            debug!(key = %key, "Dropped expired permit on read");
            return None;
        }
        Some(cached.permit.clone())
    }

    /// Insert or replace the permit, valid for one hour from now.
    pub fn set_permit(&self, address: &Address, permit_type: PermitType, permit: Permit) {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);

        let start_sweep = {
            let mut entries = self.lock();
            entries.permits.insert(
                cache_key(address, permit_type),
                CachedPermit {
                    permit,
                    timestamp: now,
                    expires_at,
                },
            );
            !entries.sweeping
        };

        if start_sweep {
            self.start_sweep();
        }
    }

    /// Time left before the permit expires, `None` once it is gone.
    pub fn time_remaining(&self, address: &Address, permit_type: PermitType) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.lock();
        entries
            .permits
            .get(&cache_key(address, permit_type))
            .and_then(|cached| remaining(cached, now))
    }

    /// Every live permit type of `address` with its remaining lifetime.
    pub fn active_permits(&self, address: &Address) -> Vec<(PermitType, Duration)> {
        PermitType::ALL
            .into_iter()
            .filter_map(|t| self.time_remaining(address, t).map(|left| (t, left)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_sweeping(&self) -> bool {
        self.lock().sweeping
    }

    fn start_sweep(&self) {
        // Without a runtime there is nothing to sweep with; reads still expire lazily.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        self.lock().sweeping = true;

        let entries: Weak<Mutex<Entries>> = Arc::downgrade(&self.entries);
        let clock = self.clock.clone();
        let period = self.sweep_interval;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = entries.upgrade() else {
                    return;
                };
                let now = clock.now();
                let mut entries = shared.lock().unwrap_or_else(|e| e.into_inner());
                let before = entries.permits.len();
                entries.permits.retain(|_, cached| now <= cached.expires_at);
                let removed = before - entries.permits.len();
                if removed > 0 {
                    debug!(removed, "Swept expired permits");
                }
                if entries.permits.is_empty() {
                    entries.sweeping = false;
                    debug!("Permit cache empty, sweep stopped");
                    return;
                }
            }
        });
    }
}

impl Default for PermitCache {
    fn default() -> Self {
        Self::new()
    }
}
