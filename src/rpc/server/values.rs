//! Capacity-bounded, age-expiring storage for immutable and mutable values.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::common::Id;

/// Default maximum number of values to store.
pub const MAX_VALUES: usize = 500;

/// How long a stored value lives before it expires.
pub const MAX_VALUE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// A store that evicts the least recently used entry at capacity, and any
/// entry older than [MAX_VALUE_AGE], whichever comes first.
#[derive(Debug)]
pub struct ValueStore<V> {
    values: LruCache<Id, (V, Instant)>,
    max_age: Duration,
}

impl<V> ValueStore<V> {
    pub fn new() -> Self {
        Self {
            values: LruCache::new(NonZeroUsize::new(MAX_VALUES).expect("MAX_VALUES is non-zero")),
            max_age: MAX_VALUE_AGE,
        }
    }

    pub fn get(&mut self, target: &Id) -> Option<&V> {
        if let Some((_, stored_at)) = self.values.peek(target) {
            if stored_at.elapsed() > self.max_age {
                self.values.pop(target);
                return None;
            }
        }

        self.values.get(target).map(|(value, _)| value)
    }

    pub fn put(&mut self, target: Id, value: V) {
        self.values.put(target, (value, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<V> Default for ValueStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lru_eviction_at_capacity() {
        let mut store = ValueStore::new();

        let first = Id::random();
        store.put(first, 0_usize);

        for i in 1..=MAX_VALUES {
            store.put(Id::random(), i);
        }

        assert_eq!(store.len(), MAX_VALUES);
        assert!(store.get(&first).is_none());
    }

    #[test]
    fn age_eviction() {
        let mut store = ValueStore {
            values: LruCache::new(NonZeroUsize::new(10).unwrap()),
            max_age: Duration::from_millis(10),
        };

        let target = Id::random();
        store.put(target, "value");

        assert_eq!(store.get(&target), Some(&"value"));

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.get(&target), None);
        assert!(store.is_empty());
    }
}
