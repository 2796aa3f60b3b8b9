//! A fixed-size chained hash table over descriptor indices.

use crate::DeviceId;
use std::num::NonZeroUsize;

/// The identity of a cached block.
pub(crate) type Key = (DeviceId, u32);

/// Maps `(device, block)` keys to the descriptor caching them.
///
/// Chains are intrusive: each descriptor has one `next`/`prev` slot, so a descriptor can be in at
/// most one chain. Keys are not stored in the table; lookups compare against the key of each
/// chained descriptor, provided by the caller.
pub(crate) struct Table {
    buckets: Vec<Option<usize>>,
    next: Vec<Option<usize>>,
    prev: Vec<Option<usize>>,
}

impl Table {
    /// Create an empty table of `buckets` chains over `entries` descriptors.
    pub fn new(buckets: NonZeroUsize, entries: usize) -> Self {
        Self {
            buckets: vec![None; buckets.get()],
            next: vec![None; entries],
            prev: vec![None; entries],
        }
    }

    fn bucket(&self, (device, block): Key) -> usize {
        ((device.raw() as u32 ^ block) as usize) % self.buckets.len()
    }

    /// Find the descriptor whose key (as reported by `key_of`) is `key`.
    pub fn find(&self, key: Key, key_of: impl Fn(usize) -> Option<Key>) -> Option<usize> {
        let mut cursor = self.buckets[self.bucket(key)];
        while let Some(index) = cursor {
            if key_of(index) == Some(key) {
                return Some(index);
            }
            cursor = self.next[index];
        }
        None
    }

    /// Link `index` at the head of the chain for `key`.
    pub fn insert(&mut self, index: usize, key: Key) {
        let bucket = self.bucket(key);
        let head = self.buckets[bucket];
        self.next[index] = head;
        self.prev[index] = None;
        if let Some(head) = head {
            self.prev[head] = Some(index);
        }
        self.buckets[bucket] = Some(index);
    }

    /// Unlink `index` from the chain for `key` (the key it was inserted with).
    ///
    /// # Panics
    ///
    /// Panics if `index` is not in that chain.
    pub fn remove(&mut self, index: usize, key: Key) {
        let (prev, next) = (self.prev[index], self.next[index]);
        if let Some(next) = next {
            self.prev[next] = prev;
        }
        match prev {
            Some(prev) => self.next[prev] = next,
            None => {
                let bucket = self.bucket(key);
                if self.buckets[bucket] != Some(index) {
                    panic!("hash chain corrupted");
                }
                self.buckets[bucket] = next;
            }
        }
        self.next[index] = None;
        self.prev[index] = None;
    }

    /// Iterate over every chained descriptor, bucket by bucket.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.buckets.iter().flat_map(move |head| {
            std::iter::successors(*head, move |&index| self.next[index])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceId = DeviceId::new(3, 0);

    fn buckets(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_insert_find_remove() {
        let keys = [(DEV, 1), (DEV, 2), (DEV, 3)];
        let mut table = Table::new(buckets(7), keys.len());
        for (index, key) in keys.iter().enumerate() {
            table.insert(index, *key);
        }
        let key_of = |index: usize| Some(keys[index]);
        for (index, key) in keys.iter().enumerate() {
            assert_eq!(table.find(*key, key_of), Some(index));
        }
        assert_eq!(table.find((DEV, 4), key_of), None);

        table.remove(1, keys[1]);
        assert_eq!(table.find(keys[1], key_of), None);
        assert_eq!(table.find(keys[0], key_of), Some(0));
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn test_colliding_chain() {
        // With a single bucket, every key shares one chain
        let keys = [(DEV, 10), (DEV, 20), (DEV, 30), (DEV, 40)];
        let mut table = Table::new(buckets(1), keys.len());
        for (index, key) in keys.iter().enumerate() {
            table.insert(index, *key);
        }
        let key_of = |index: usize| Some(keys[index]);

        // Remove the head, an interior entry, and the tail of the chain
        table.remove(3, keys[3]);
        table.remove(1, keys[1]);
        table.remove(0, keys[0]);
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(table.find(keys[2], key_of), Some(2));

        // Reinsert
        table.insert(0, keys[0]);
        assert_eq!(table.find(keys[0], key_of), Some(0));
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    #[should_panic(expected = "hash chain corrupted")]
    fn test_remove_unchained() {
        let mut table = Table::new(buckets(7), 2);
        table.insert(0, (DEV, 1));
        table.remove(1, (DEV, 1));
    }
}
