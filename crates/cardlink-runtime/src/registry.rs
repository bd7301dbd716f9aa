//! Handle registry.
//!
//! Maps opaque handles to live objects. Handles are drawn from one
//! process-wide counter, so a handle is never reused once issued, even across
//! registries, and a removed entry can never be reached again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use cardlink_core::{CardHandle, DeviceHandle};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// A handle type that can be issued by a [`Registry`].
pub trait RegistryKey: Copy + Ord + fmt::Debug + fmt::Display {
    fn from_raw(raw: u64) -> Self;
}

impl RegistryKey for DeviceHandle {
    fn from_raw(raw: u64) -> Self {
        DeviceHandle::from_raw(raw)
    }
}

impl RegistryKey for CardHandle {
    fn from_raw(raw: u64) -> Self {
        CardHandle::from_raw(raw)
    }
}

fn next_handle<K: RegistryKey>() -> K {
    K::from_raw(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// Handle-keyed table of live objects, iterated in issue order.
#[derive(Debug)]
pub struct Registry<K, T> {
    entries: BTreeMap<K, T>,
}

impl<K: RegistryKey, T> Registry<K, T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Store `value` under a freshly issued handle.
    pub fn insert(&mut self, value: T) -> K {
        self.insert_with(|_| value).0
    }

    /// Issue a handle and build the value with it.
    pub fn insert_with(&mut self, build: impl FnOnce(K) -> T) -> (K, &T) {
        let handle = next_handle();
        let value = self.entries.entry(handle).or_insert(build(handle));
        (handle, value)
    }

    pub fn get(&self, handle: K) -> Option<&T> {
        self.entries.get(&handle)
    }

    pub fn contains(&self, handle: K) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Remove and return the entry. A second removal returns `None`.
    pub fn remove(&mut self, handle: K) -> Option<T> {
        self.entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> Vec<K> {
        self.entries.keys().copied().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Empty the registry, returning the entries in issue order.
    pub fn drain(&mut self) -> Vec<(K, T)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

impl<K: RegistryKey, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
