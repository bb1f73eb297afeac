//! Per-key state storage shared by the limiter implementations.
//!
//! Keys are spread over the independently locked shards of a [`DashMap`].
//! A read-modify-write on one key holds only that key's shard lock, so
//! updates to the same key are serialized while unrelated keys proceed in
//! parallel.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// State that records when its key was last used.
pub trait IdleState {
    fn last_seen(&self) -> DateTime<Utc>;
}

/// Concurrent map from rate limit key to algorithm state.
pub struct StateMap<S> {
    states: DashMap<String, S>,
}

impl<S: IdleState> StateMap<S> {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Run `update` against the existing state for `key`, or create it with
    /// `create`, while holding the key's shard lock.
    pub fn update<R>(
        &self,
        key: &str,
        create: impl FnOnce() -> (S, R),
        update: impl FnOnce(&mut S) -> R,
    ) -> R {
        // Lookups by &str avoid allocating on the hot path; entry() needs
        // an owned key only when the state does not exist yet.
        if let Some(mut state) = self.states.get_mut(key) {
            return update(state.value_mut());
        }

        match self.states.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => update(occupied.get_mut()),
            Entry::Vacant(vacant) => {
                let (state, result) = create();
                vacant.insert(state);
                result
            }
        }
    }

    /// Read the state for `key` without modifying it.
    pub fn inspect<R>(&self, key: &str, read: impl FnOnce(&S) -> R) -> Option<R> {
        self.states.get(key).map(|state| read(state.value()))
    }

    pub fn remove(&self, key: &str) -> bool {
        self.states.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.states.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    /// Drop every entry not seen since `now - ttl`. Returns how many were
    /// removed.
    pub fn evict_idle(&self, now: DateTime<Utc>, ttl: TimeDelta) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| now - state.last_seen() <= ttl);
        before.saturating_sub(self.states.len())
    }
}

impl<S: IdleState> Default for StateMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Seen(DateTime<Utc>, u32);

    impl IdleState for Seen {
        fn last_seen(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_update_creates_then_mutates() {
        let map: StateMap<Seen> = StateMap::new();
        let now = Utc::now();

        let created = map.update("k", || (Seen(now, 1), true), |_| false);
        assert!(created);

        let count = map.update(
            "k",
            || (Seen(now, 0), 0),
            |s| {
                s.1 += 1;
                s.1
            },
        );
        assert_eq!(count, 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_evict_idle() {
        let map: StateMap<Seen> = StateMap::new();
        let now = Utc::now();

        map.update("old", || (Seen(now - TimeDelta::seconds(120), 0), ()), |_| ());
        map.update("fresh", || (Seen(now - TimeDelta::seconds(5), 0), ()), |_| ());

        let evicted = map.evict_idle(now, TimeDelta::seconds(60));

        assert_eq!(evicted, 1);
        assert!(!map.contains("old"));
        assert!(map.contains("fresh"));
    }

    #[test]
    fn test_remove_and_clear() {
        let map: StateMap<Seen> = StateMap::new();
        let now = Utc::now();
        map.update("a", || (Seen(now, 0), ()), |_| ());
        map.update("b", || (Seen(now, 0), ()), |_| ());

        assert!(map.remove("a"));
        assert!(!map.remove("a"));
        assert_eq!(map.len(), 1);

        map.clear();
        assert!(map.is_empty());
    }
}
