//! Lease expiry scheduler
//!
//! A single background task owns a min-heap of deadlines. Leases are armed
//! through a channel and handed back to the expiry callback in deadline
//! order. Dropping the scheduler closes the channel and stops the task, so
//! pending leases never outlive their cache.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// An armed lease
struct Lease<K> {
    deadline: Instant,
    /// Arming order, breaks deadline ties
    seq: u64,
    key: K,
    /// Entry incarnation the lease was armed for
    epoch: u64,
}

impl<K> PartialEq for Lease<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for Lease<K> {}

impl<K> PartialOrd for Lease<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Lease<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Handle to the expiry task
pub struct LeaseScheduler<K> {
    tx: mpsc::UnboundedSender<Lease<K>>,
    seq: AtomicU64,
}

impl<K: Send + 'static> LeaseScheduler<K> {
    /// Spawn the expiry task; `on_expire` runs on it for every lease
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(on_expire: impl Fn(K, u64) + Send + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, on_expire));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Arm a lease on `key` expiring after `lease`
    pub fn arm(&self, key: K, epoch: u64, lease: Duration) {
        let lease = Lease {
            deadline: Instant::now() + lease,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            key,
            epoch,
        };
        if self.tx.send(lease).is_err() {
            debug!("Lease scheduler is gone, dropping lease");
        }
    }
}

async fn run<K>(mut rx: mpsc::UnboundedReceiver<Lease<K>>, on_expire: impl Fn(K, u64)) {
    let mut pending: BinaryHeap<Reverse<Lease<K>>> = BinaryHeap::new();

    loop {
        let next = pending.peek().map(|Reverse(lease)| lease.deadline);
        tokio::select! {
            armed = rx.recv() => match armed {
                Some(lease) => pending.push(Reverse(lease)),
                None => break,
            },
            () = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                while pending.peek().is_some_and(|Reverse(lease)| lease.deadline <= now) {
                    if let Some(Reverse(lease)) = pending.pop() {
                        on_expire(lease.key, lease.epoch);
                    }
                }
            }
        }
    }

    debug!("Lease scheduler stopped with {} pending leases", pending.len());
}
