//! Expiring caches for white-balance gains and processed results

use crate::error::{PolcamError, Result};
use crate::types::{PolarizationAngle, ProcessingMode};
use parking_lot::Mutex;
use polmath::ChannelGains;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

/// Key/value store whose entries expire `valid_duration` after insertion
///
/// Expired entries are evicted lazily when read. In permanent mode nothing
/// expires; switching back to temporary mode makes the stored duration govern
/// expiry again, measured from each entry's original insertion time. An
/// optional capacity evicts the oldest-inserted entry on overflow.
pub struct TimedCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    order: VecDeque<K>,
    valid_duration: Duration,
    permanent: bool,
    capacity: Option<usize>,
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(valid_duration: Duration) -> Result<Self> {
        check_duration(valid_duration)?;
        Ok(Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            valid_duration,
            permanent: false,
            capacity: None,
        })
    }

    pub fn with_capacity(valid_duration: Duration, capacity: usize) -> Result<Self> {
        let mut cache = Self::new(valid_duration)?;
        cache.capacity = Some(capacity);
        Ok(cache)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`
    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<&V> {
        if self.is_expired_at(key, now) {
            self.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Store `value` stamped with the current time; the expiry mode is unchanged
    pub fn set(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
        self.enforce_capacity();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True for unknown keys and for entries older than the valid duration
    pub fn is_expired(&self, key: &K) -> bool {
        self.is_expired_at(key, Instant::now())
    }

    fn is_expired_at(&self, key: &K, now: Instant) -> bool {
        match self.entries.get(key) {
            None => true,
            Some(_) if self.permanent => false,
            Some(entry) => now.saturating_duration_since(entry.created_at) > self.valid_duration,
        }
    }

    /// Change the time-to-live; this also leaves permanent mode
    pub fn set_valid_duration(&mut self, duration: Duration) -> Result<()> {
        check_duration(duration)?;
        self.valid_duration = duration;
        self.permanent = false;
        Ok(())
    }

    pub fn valid_duration(&self) -> Duration {
        self.valid_duration
    }

    pub fn set_permanent(&mut self) {
        self.permanent = true;
    }

    /// Leave permanent mode, optionally with a new time-to-live
    pub fn set_temporary(&mut self, duration: Option<Duration>) -> Result<()> {
        match duration {
            Some(d) => self.set_valid_duration(d),
            None => {
                self.permanent = false;
                Ok(())
            }
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Set or lift the entry limit, evicting the oldest entries if needed
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        let Some(limit) = self.capacity else {
            return;
        };
        while self.order.len() > limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Return the fresh cached value or compute, store and return a new one
    pub fn get_or_try_insert_with<E, F>(&mut self, key: K, compute: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value.clone());
        }
        let value = compute()?;
        self.set(key, value.clone());
        Ok(value)
    }
}

fn check_duration(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Err(PolcamError::validation(
            "cache valid duration must be greater than 0",
        ));
    }
    Ok(())
}

/// Gain cache partition, one per family of display modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GainScope {
    Single,
    Merged,
    Quad,
    Polarization,
}

impl GainScope {
    pub const ALL: [GainScope; 4] = [
        GainScope::Single,
        GainScope::Merged,
        GainScope::Quad,
        GainScope::Polarization,
    ];

    /// `None` for modes that never white-balance
    pub fn for_mode(mode: ProcessingMode) -> Option<GainScope> {
        match mode {
            ProcessingMode::Raw => None,
            ProcessingMode::SingleColor | ProcessingMode::SingleGray => Some(GainScope::Single),
            ProcessingMode::MergedColor | ProcessingMode::MergedGray => Some(GainScope::Merged),
            ProcessingMode::QuadColor | ProcessingMode::QuadGray => Some(GainScope::Quad),
            ProcessingMode::Polarization => Some(GainScope::Polarization),
        }
    }
}

/// Slot inside a scope: per angle, or one shared slot for merged images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GainKey {
    Angle(PolarizationAngle),
    Combined,
}

/// Four independently locked gain caches, so a mode switch never has to
/// invalidate gains computed for the other modes
pub struct WhiteBalanceCache {
    single: Mutex<TimedCache<GainKey, ChannelGains>>,
    merged: Mutex<TimedCache<GainKey, ChannelGains>>,
    quad: Mutex<TimedCache<GainKey, ChannelGains>>,
    polarization: Mutex<TimedCache<GainKey, ChannelGains>>,
}

impl WhiteBalanceCache {
    pub fn new(valid_duration: Duration) -> Result<Self> {
        Ok(Self {
            single: Mutex::new(TimedCache::new(valid_duration)?),
            merged: Mutex::new(TimedCache::new(valid_duration)?),
            quad: Mutex::new(TimedCache::new(valid_duration)?),
            polarization: Mutex::new(TimedCache::new(valid_duration)?),
        })
    }

    fn scope(&self, scope: GainScope) -> &Mutex<TimedCache<GainKey, ChannelGains>> {
        match scope {
            GainScope::Single => &self.single,
            GainScope::Merged => &self.merged,
            GainScope::Quad => &self.quad,
            GainScope::Polarization => &self.polarization,
        }
    }

    pub fn get(&self, scope: GainScope, key: GainKey) -> Option<ChannelGains> {
        self.scope(scope).lock().get(&key).cloned()
    }

    pub fn set(&self, scope: GainScope, key: GainKey, gains: ChannelGains) {
        self.scope(scope).lock().set(key, gains);
    }

    /// Cached gains when fresh and matching `channels`, otherwise recompute
    ///
    /// The lock is not held while `compute` runs.
    pub fn get_or_compute<F>(
        &self,
        scope: GainScope,
        key: GainKey,
        channels: usize,
        compute: F,
    ) -> Result<ChannelGains>
    where
        F: FnOnce() -> polmath::Result<ChannelGains>,
    {
        if let Some(gains) = self.get(scope, key) {
            if gains.len() == channels {
                return Ok(gains);
            }
        }
        let gains = compute()?;
        log::debug!("Computed {:?} gains for {:?}/{:?}", gains.as_slice(), scope, key);
        self.set(scope, key, gains.clone());
        Ok(gains)
    }

    pub fn len(&self, scope: GainScope) -> usize {
        self.scope(scope).lock().len()
    }

    pub fn clear(&self, scope: GainScope) {
        self.scope(scope).lock().clear();
    }

    pub fn clear_all(&self) {
        for scope in GainScope::ALL {
            self.clear(scope);
        }
    }

    pub fn set_valid_duration(&self, duration: Duration) -> Result<()> {
        check_duration(duration)?;
        for scope in GainScope::ALL {
            self.scope(scope).lock().set_valid_duration(duration)?;
        }
        Ok(())
    }

    pub fn set_permanent(&self) {
        for scope in GainScope::ALL {
            self.scope(scope).lock().set_permanent();
        }
    }

    pub fn set_temporary(&self, duration: Option<Duration>) -> Result<()> {
        if let Some(d) = duration {
            check_duration(d)?;
        }
        for scope in GainScope::ALL {
            self.scope(scope).lock().set_temporary(duration)?;
        }
        Ok(())
    }

    pub fn is_permanent(&self) -> bool {
        self.single.lock().is_permanent()
    }
}
