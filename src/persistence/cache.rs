//! Bounded write-through state cache
//!
//! Entries are evicted least-recently-used first once the capacity is
//! exceeded, and expire after `ttl` without access. An access-order index
//! keeps eviction `O(log n)`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::PersistedState;
use crate::utils::to_chrono;

struct CacheEntry {
    state: PersistedState,
    last_access: DateTime<Utc>,
    tick: u64,
}

pub struct StateCache {
    capacity: usize,
    ttl: Option<Duration>,
    entries: HashMap<String, CacheEntry>,
    /// access tick -> id, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl StateCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.ttl
            .map(|ttl| now - entry.last_access > to_chrono(ttl))
            .unwrap_or(false)
    }

    /// A copy of the cached state, refreshing its position
    pub fn get(&mut self, state_machine_id: &str, now: DateTime<Utc>) -> Option<PersistedState> {
        let expired = self.is_expired(self.entries.get(state_machine_id)?, now);
        if expired {
            self.remove(state_machine_id);
            return None;
        }

        let tick = self.tick();
        let entry = self.entries.get_mut(state_machine_id)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        entry.last_access = now;
        self.order.insert(tick, state_machine_id.to_string());
        Some(entry.state.clone())
    }

    /// Insert or replace; returns the ids evicted to stay within capacity
    pub fn put(&mut self, state_machine_id: &str, state: PersistedState, now: DateTime<Utc>) -> Vec<String> {
        let tick = self.tick();
        if let Some(previous) = self.entries.insert(
            state_machine_id.to_string(),
            CacheEntry {
                state,
                last_access: now,
                tick,
            },
        ) {
            self.order.remove(&previous.tick);
        }
        self.order.insert(tick, state_machine_id.to_string());

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn remove(&mut self, state_machine_id: &str) -> Option<PersistedState> {
        let entry = self.entries.remove(state_machine_id)?;
        self.order.remove(&entry.tick);
        Some(entry.state)
    }

    /// Drop every entry idle longer than the TTL; returns how many
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_lru_eviction() {
        let now = Utc::now();
        let mut cache = StateCache::new(2, None);
        cache.put("a", PersistedState::new("a"), now);
        cache.put("b", PersistedState::new("b"), now);
        assert!(cache.get("a", now).is_some());

        let evicted = cache.put("c", PersistedState::new("c"), now);
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(cache.get("b", now).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let now = Utc::now();
        let mut cache = StateCache::new(10, Some(Duration::from_secs(60)));
        cache.put("a", PersistedState::new("a"), now);
        cache.put("b", PersistedState::new("b"), now + ChronoDuration::seconds(50));

        assert!(cache.get("a", now + ChronoDuration::seconds(30)).is_some());
        assert_eq!(cache.expire(now + ChronoDuration::seconds(100)), 1);
        assert!(cache.get("b", now + ChronoDuration::seconds(100)).is_some());
        assert!(cache.get("b", now + ChronoDuration::seconds(200)).is_none());
        assert!(cache.is_empty());
    }
}
