//! Reference-counted instance cache
//!
//! Holds hot objects shared by concurrent requests. Every entry carries a
//! counter; inserting an entry and completing a use each arm one lease, and
//! each expiring lease takes one count back. An entry is evicted when an
//! expiring lease brings its counter to zero.
//!
//! Leases carry the epoch of the entry they were armed for, so a lease left
//! over from an evicted or replaced entry never touches its successor.

use crate::lease::LeaseScheduler;
use cumulus_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

struct Entry<V> {
    instance: Arc<V>,
    counter: i64,
    epoch: u64,
}

type Entries<K, V> = Mutex<HashMap<K, Entry<V>>>;

/// Lease-expiring cache of shared instances
pub struct InstanceCache<K, V> {
    name: &'static str,
    entries: Arc<Entries<K, V>>,
    scheduler: LeaseScheduler<K>,
    lease: Duration,
    epochs: AtomicU64,
}

impl<K, V> InstanceCache<K, V>
where
    K: Copy + Eq + Hash + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Empty cache whose leases last `lease`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &'static str, lease: Duration) -> Self {
        let entries: Arc<Entries<K, V>> = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(&entries);
        let scheduler = LeaseScheduler::spawn(move |key, epoch| expire(name, &weak, key, epoch));

        Self {
            name,
            entries,
            scheduler,
            lease,
            epochs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    /// Insert `instance` with a counter of one and arm its first lease
    ///
    /// An entry already stored under `key` is replaced.
    pub fn enqueue_instance(&self, key: K, instance: Arc<V>) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            key,
            Entry {
                instance,
                counter: 1,
                epoch,
            },
        );
        self.scheduler.arm(key, epoch, self.lease);
        debug!("Enqueued {} in {}", key, self.name);
    }

    /// Stored instance, without touching its counter
    #[must_use]
    pub fn get_enqueued_instance(&self, key: K) -> Option<Arc<V>> {
        self.entries
            .lock()
            .get(&key)
            .map(|entry| Arc::clone(&entry.instance))
    }

    /// Take one more count on an entry
    ///
    /// The count is given back by the lease armed by the matching
    /// [`InstanceCache::mark_as_completed`].
    ///
    /// # Errors
    /// Returns `Error::NotEnqueued` if no entry is stored under `key`.
    pub fn mark_as_used(&self, key: K) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            warn!("Cannot mark {} as used, it is not enqueued in {}", key, self.name);
            return Err(Error::NotEnqueued(key.to_string()));
        };
        entry.counter += 1;
        Ok(())
    }

    /// Arm a lease giving back the count taken by [`InstanceCache::mark_as_used`]
    ///
    /// # Errors
    /// Returns `Error::NotEnqueued` if no entry is stored under `key`.
    pub fn mark_as_completed(&self, key: K) -> Result<()> {
        let epoch = self.entries.lock().get(&key).map(|entry| entry.epoch);
        let Some(epoch) = epoch else {
            warn!("Cannot mark {} as completed, it is not enqueued in {}", key, self.name);
            return Err(Error::NotEnqueued(key.to_string()));
        };
        self.scheduler.arm(key, epoch, self.lease);
        Ok(())
    }

    /// Evict an entry regardless of its counter
    pub fn remove_enqueued_instance(&self, key: K) -> Option<Arc<V>> {
        let removed = self.entries.lock().remove(&key);
        if removed.is_some() {
            debug!("Removed {} from {}", key, self.name);
        }
        removed.map(|entry| entry.instance)
    }

    /// Current counter of an entry
    #[must_use]
    pub fn counter(&self, key: K) -> Option<i64> {
        self.entries.lock().get(&key).map(|entry| entry.counter)
    }

    /// Snapshot of every stored instance
    #[must_use]
    pub fn instances(&self) -> Vec<Arc<V>> {
        self.entries
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.instance))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn expire<K, V>(name: &str, entries: &Weak<Entries<K, V>>, key: K, epoch: u64)
where
    K: Eq + Hash + Display,
{
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let mut entries = entries.lock();
    let Some(entry) = entries.get_mut(&key) else {
        return;
    };
    if entry.epoch != epoch {
        return;
    }

    entry.counter -= 1;
    if entry.counter <= 0 {
        entries.remove(&key);
        debug!("Lease of {} in {} expired, evicted", key, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn cache(lease_ms: u64) -> InstanceCache<u32, String> {
        InstanceCache::new("test", Duration::from_millis(lease_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_entry_expires_after_one_lease() {
        let cache = cache(1000);
        cache.enqueue_instance(1, Arc::new("volume".to_string()));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(cache.get_enqueued_instance(1).unwrap().as_str(), "volume");
        assert_eq!(cache.counter(1), Some(1));

        sleep(Duration::from_millis(1000)).await;
        assert!(cache.get_enqueued_instance(1).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_use_extends_residency() {
        let cache = cache(1000);
        cache.enqueue_instance(1, Arc::new("file".to_string()));

        sleep(Duration::from_millis(600)).await;
        cache.mark_as_used(1).unwrap();
        assert_eq!(cache.counter(1), Some(2));
        cache.mark_as_completed(1).unwrap();

        // First lease expires at 1.0s, the second at 1.6s
        sleep(Duration::from_millis(700)).await;
        assert_eq!(cache.counter(1), Some(1));

        sleep(Duration::from_millis(400)).await;
        assert!(cache.get_enqueued_instance(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_in_use_is_not_evicted() {
        let cache = cache(1000);
        cache.enqueue_instance(1, Arc::new("file".to_string()));
        cache.mark_as_used(1).unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(cache.counter(1), Some(1));
        assert!(cache.get_enqueued_instance(1).is_some());

        cache.mark_as_completed(1).unwrap();
        sleep(Duration::from_millis(1001)).await;
        assert!(cache.get_enqueued_instance(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_is_immediate() {
        let cache = cache(1000);
        cache.enqueue_instance(1, Arc::new("volume".to_string()));
        cache.mark_as_used(1).unwrap();
        cache.mark_as_used(1).unwrap();

        assert_eq!(cache.remove_enqueued_instance(1).unwrap().as_str(), "volume");
        assert!(cache.get_enqueued_instance(1).is_none());
        assert!(cache.remove_enqueued_instance(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_entries_are_not_enqueued() {
        let cache = cache(1000);
        assert_eq!(cache.mark_as_used(9).unwrap_err().code(), "TRN-004");
        assert_eq!(cache.mark_as_completed(9).unwrap_err().code(), "TRN-004");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_leases_do_not_touch_replacement() {
        let cache = cache(1000);
        cache.enqueue_instance(1, Arc::new("old".to_string()));
        cache.remove_enqueued_instance(1);

        sleep(Duration::from_millis(500)).await;
        cache.enqueue_instance(1, Arc::new("new".to_string()));

        // The lease of "old" fires at 1.0s
        sleep(Duration::from_millis(700)).await;
        assert_eq!(cache.get_enqueued_instance(1).unwrap().as_str(), "new");

        sleep(Duration::from_millis(400)).await;
        assert!(cache.get_enqueued_instance(1).is_none());
    }
}
