//! Refcounted resource pool.
//!
//! A pool maps a structural key (for example port + vlan + source MAC +
//! destination MAC for an egress rewrite) to the value the hardware handed
//! back when the resource was created. The pool never creates entries on its
//! own: [`ResourcePool::acquire`] and [`ResourcePool::release`] are the only
//! mutators of the refcount and each takes the hardware primitive as a
//! closure, so the 0 -> 1 and 1 -> 0 transitions are the only places the
//! hardware is touched.

use log::{debug, warn};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Types that carry a reference count.
pub trait HasRefCount {
    /// Increments and returns the new count.
    fn increment_ref(&mut self) -> u32;

    /// Decrements and returns the new count, or `None` on underflow.
    fn decrement_ref(&mut self) -> Option<u32>;

    fn ref_count(&self) -> u32;
}

/// A live pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry<V> {
    pub value: V,
    refcount: u32,
}

impl<V> HasRefCount for PoolEntry<V> {
    fn increment_ref(&mut self) -> u32 {
        self.refcount = self.refcount.saturating_add(1);
        self.refcount
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.refcount = self.refcount.checked_sub(1)?;
        Some(self.refcount)
    }

    fn ref_count(&self) -> u32 {
        self.refcount
    }
}

/// Outcome of [`ResourcePool::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release<V> {
    /// Other references remain; the count left is returned.
    Retained(u32),
    /// Last reference dropped; the destroy primitive ran on this value.
    Destroyed(V),
    /// The key was not in the pool. Logged, nothing done.
    Unknown,
}

impl<V> Release<V> {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Release::Destroyed(_))
    }
}

/// Dedup + refcount map. See the module docs.
#[derive(Debug, Clone)]
pub struct ResourcePool<K, V> {
    name: &'static str,
    entries: HashMap<K, PoolEntry<V>>,
}

impl<K, V> ResourcePool<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the value for `key`, creating it through `create` if the key is
    /// not live yet. A failed `create` leaves the pool untouched.
    pub fn acquire<E>(
        &mut self,
        key: &K,
        create: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(entry) = self.entries.get_mut(key) {
            let count = entry.increment_ref();
            debug!("{}: {:?} refcount -> {}", self.name, key, count);
            return Ok(entry.value.clone());
        }

        let value = create(key)?;
        self.entries.insert(
            key.clone(),
            PoolEntry {
                value: value.clone(),
                refcount: 1,
            },
        );
        debug!("{}: created {:?}", self.name, key);
        Ok(value)
    }

    /// Drops one reference. On the last one the entry is removed and
    /// `destroy` runs exactly once; its error is returned but the entry stays
    /// removed.
    pub fn release<E>(
        &mut self,
        key: &K,
        destroy: impl FnOnce(&K, &V) -> Result<(), E>,
    ) -> Result<Release<V>, E> {
        let Some(entry) = self.entries.get_mut(key) else {
            warn!("{}: release of unknown key {:?}", self.name, key);
            return Ok(Release::Unknown);
        };

        match entry.decrement_ref() {
            Some(count) if count > 0 => {
                debug!("{}: {:?} refcount -> {}", self.name, key, count);
                Ok(Release::Retained(count))
            }
            _ => {
                let Some(entry) = self.entries.remove(key) else {
                    return Ok(Release::Unknown);
                };
                debug!("{}: destroying {:?}", self.name, key);
                destroy(key, &entry.value)?;
                Ok(Release::Destroyed(entry.value))
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Mutable access to the value; the refcount is not reachable this way.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Live refcount, 0 for unknown keys.
    pub fn refcount(&self, key: &K) -> u32 {
        self.entries.get(key).map_or(0, |e| e.ref_count())
    }

    /// Moves an entry to a new key, keeping value and refcount. Fails if
    /// `from` is unknown or `to` is already live.
    pub fn rekey(&mut self, from: &K, to: K) -> bool {
        if self.entries.contains_key(&to) {
            warn!("{}: rekey target {:?} already live", self.name, to);
            return false;
        }
        match self.entries.remove(from) {
            Some(entry) => {
                self.entries.insert(to, entry);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Keys whose entry satisfies `pred`, cloned so the caller can mutate
    /// the pool while walking them.
    pub fn keys_where(&self, pred: impl Fn(&K, &V) -> bool) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(k, e)| pred(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the pool without calling any destroy primitive. Used when the
    /// hardware is being reset wholesale.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.entries.drain().map(|(k, e)| (k, e.value)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Hw {
        next: u32,
        created: RefCell<Vec<u32>>,
        destroyed: RefCell<Vec<u32>>,
    }

    impl Hw {
        fn create(&mut self) -> Result<u32, String> {
            self.next += 1;
            self.created.borrow_mut().push(self.next);
            Ok(self.next)
        }

        fn destroy(&self, id: u32) -> Result<(), String> {
            self.destroyed.borrow_mut().push(id);
            Ok(())
        }
    }

    #[test]
    fn test_acquire_release_refcount_law() {
        let mut hw = Hw::default();
        let mut pool: ResourcePool<(u16, u16), u32> = ResourcePool::new("egress");
        let key = (3, 10);

        let a = pool.acquire(&key, |_| hw.create()).unwrap();
        let b = pool.acquire(&key, |_| hw.create()).unwrap();
        let c = pool.acquire(&key, |_| hw.create()).unwrap();
        assert_eq!((a, b, c), (1, 1, 1));
        assert_eq!(pool.refcount(&key), 3);
        assert_eq!(hw.created.borrow().len(), 1);

        assert_eq!(pool.release(&key, |_, id| hw.destroy(*id)).unwrap(), Release::Retained(2));
        assert_eq!(pool.release(&key, |_, id| hw.destroy(*id)).unwrap(), Release::Retained(1));
        assert!(hw.destroyed.borrow().is_empty());
        assert_eq!(pool.release(&key, |_, id| hw.destroy(*id)).unwrap(), Release::Destroyed(1));
        assert_eq!(*hw.destroyed.borrow(), vec![1]);
        assert!(pool.is_empty());

        // 0 -> 1 again creates a fresh resource
        let d = pool.acquire(&key, |_| hw.create()).unwrap();
        assert_eq!(d, 2);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut pool: ResourcePool<u8, u32> = ResourcePool::new("ecmp");
        let r: Result<_, String> = pool.release(&7, |_, _| panic!("must not destroy"));
        assert_eq!(r.unwrap(), Release::Unknown);
    }

    #[test]
    fn test_failed_create_leaves_pool_empty() {
        let mut pool: ResourcePool<u8, u32> = ResourcePool::new("nh");
        let r: Result<u32, &str> = pool.acquire(&1, |_| Err("table full"));
        assert!(r.is_err());
        assert!(!pool.contains(&1));
        assert_eq!(pool.refcount(&1), 0);
    }

    #[test]
    fn test_failed_destroy_still_removes() {
        let mut pool: ResourcePool<u8, u32> = ResourcePool::new("nh");
        pool.acquire::<()>(&1, |_| Ok(9)).unwrap();
        let r = pool.release(&1, |_, _| Err("gone"));
        assert_eq!(r, Err("gone"));
        assert!(!pool.contains(&1));
    }

    #[test]
    fn test_rekey() {
        let mut pool: ResourcePool<&'static str, u32> = ResourcePool::new("egress");
        pool.acquire::<()>(&"old", |_| Ok(5)).unwrap();
        pool.acquire::<()>(&"old", |_| Ok(5)).unwrap();
        pool.acquire::<()>(&"busy", |_| Ok(6)).unwrap();

        assert!(!pool.rekey(&"old", "busy"));
        assert!(pool.rekey(&"old", "new"));
        assert_eq!(pool.refcount(&"new"), 2);
        assert_eq!(pool.get(&"new"), Some(&5));
        assert!(!pool.rekey(&"old", "other"));
    }
}
