use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use crate::error::Result;

/// Bounded LRU cache with read-ahead fill and write-through, used to back
/// FAT chain reads.
///
/// `get` takes a fill callback returning `(key, value)` pairs running
/// forward from the requested key (front element first, possibly shorter
/// than the read-ahead width at chain end). Prefetched entries are
/// installed cold so they evict before anything the caller actually
/// touched. `put` updates in place or inserts, then writes through.
pub struct ReadCache<K, V> {
    capacity: usize,
    readahead: usize,
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    map: HashMap<K, V>,
    // LRU order, front = coldest.
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Copy, V: Copy> ReadCache<K, V> {
    pub fn new(capacity: usize, readahead: usize) -> Self {
        assert!(capacity != 0);
        ReadCache {
            capacity,
            readahead,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value for `k`, filling on miss.
    pub fn get<F>(&self, k: K, fill: F) -> Option<V>
    where
        F: FnOnce(K, usize) -> Vec<(K, V)>,
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&v) = inner.map.get(&k) {
            inner.touch(k);
            return Some(v);
        }
        let run = fill(k, self.readahead);
        let (&(_, front), rest) = run.split_first()?;
        inner.evict_to(self.capacity.saturating_sub(run.len()));
        for &(rk, rv) in rest.iter().rev() {
            if inner.map.insert(rk, rv).is_none() {
                inner.order.push_front(rk);
            }
        }
        if inner.map.insert(k, front).is_none() {
            inner.order.push_back(k);
        } else {
            inner.touch(k);
        }
        Some(front)
    }

    /// Update or insert `k`, refreshing recency, then write through.
    pub fn put<F>(&self, k: K, v: V, write: F) -> Result<()>
    where
        F: FnOnce(K, V) -> Result<()>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.map.insert(k, v).is_some() {
                inner.touch(k);
            } else {
                inner.evict_to(self.capacity.saturating_sub(1));
                inner.order.push_back(k);
            }
        }
        write(k, v)
    }
}

impl<K: Eq + Hash + Copy, V> Inner<K, V> {
    fn touch(&mut self, k: K) {
        if let Some(pos) = self.order.iter().position(|x| *x == k) {
            self.order.remove(pos);
            self.order.push_back(k);
        }
    }

    fn evict_to(&mut self, target: usize) {
        while self.map.len() > target {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_fills_with_readahead() {
        let cache: ReadCache<u32, u32> = ReadCache::new(8, 4);
        let v = cache.get(10, |k, ahead| {
            assert_eq!(ahead, 4);
            (0..ahead as u32).map(|i| (k + i, 100 + i)).collect()
        });
        assert_eq!(v, Some(100));
        // Prefetched successor hits without a second fill.
        let v = cache.get(11, |_, _| panic!("should be cached"));
        assert_eq!(v, Some(101));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_empty_fill_is_none() {
        let cache: ReadCache<u32, u32> = ReadCache::new(4, 2);
        assert_eq!(cache.get(1, |_, _| Vec::new()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_prefers_prefetched() {
        let cache: ReadCache<u32, u32> = ReadCache::new(4, 4);
        cache.get(0, |k, a| (0..a as u32).map(|i| (k + i, i)).collect());
        // Touch key 0 so the untouched prefetch tail is coldest.
        cache.get(0, |_, _| panic!());
        cache.put(100, 7, |_, _| Ok(())).unwrap();
        assert_eq!(cache.get(100, |_, _| panic!()), Some(7));
        assert_eq!(cache.get(0, |_, _| panic!()), Some(0));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_put_writes_through_in_order() {
        let cache: ReadCache<u32, u32> = ReadCache::new(4, 2);
        let mut log = Vec::new();
        for i in 0..3 {
            cache
                .put(i, i * 10, |k, v| {
                    log.push((k, v));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(log, vec![(0, 0), (1, 10), (2, 20)]);
    }
}
