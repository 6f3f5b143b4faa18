//! Disk readiness probing
//!
//! Probing a remote backend is slow, so callers read a cached flag that a
//! background task keeps fresh. At most one refresh is queued per disk at any
//! time, no matter how many requests ask concurrently.

use async_trait::async_trait;
use cumulus_common::config::ReadinessConfig;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Readiness of a disk
#[async_trait]
pub trait DiskReadiness: Send + Sync {
    /// Cached readiness; schedules a background refresh if none is queued
    async fn is_ready(&self) -> bool;

    /// Probe now, update the cache and return the fresh value
    async fn is_ready_force(&self) -> bool;

    /// Cached readiness; always schedules a one-shot background refresh
    async fn is_ready_force_non_blocking(&self) -> bool;
}

/// Probe reporting whether the backend currently answers
pub type ReadinessProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Check reporting whether the disk is still worth probing
pub type AlivenessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug)]
struct ReadinessState {
    ready: bool,
    refresh_queued: bool,
}

struct Shared {
    state: Mutex<ReadinessState>,
    probe: ReadinessProbe,
    alive: AlivenessCheck,
    check_interval: Duration,
    non_blocking_delay: Duration,
}

/// Self-refreshing cached readiness of a single real disk
pub struct CachedReadiness {
    shared: Arc<Shared>,
}

impl CachedReadiness {
    /// New readiness cache, optimistically ready until the first probe
    #[must_use]
    pub fn new(probe: ReadinessProbe, alive: AlivenessCheck, config: &ReadinessConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ReadinessState {
                    ready: true,
                    refresh_queued: false,
                }),
                probe,
                alive,
                check_interval: config.check_interval(),
                non_blocking_delay: config.force_non_blocking_delay(),
            }),
        }
    }

    /// Cached value without any side effect
    #[must_use]
    pub fn cached(&self) -> bool {
        self.shared.state.lock().ready
    }

    #[must_use]
    pub fn is_refresh_queued(&self) -> bool {
        self.shared.state.lock().refresh_queued
    }
}

/// Queue a refresh after `delay` unless one is already queued
///
/// The task holds only a weak reference while sleeping, so dropping the
/// cache ends the refresh chain.
fn schedule_refresh(shared: &Arc<Shared>, delay: Duration) {
    {
        let mut state = shared.state.lock();
        if state.refresh_queued {
            return;
        }
        state.refresh_queued = true;
    }

    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let ready = (shared.probe)().await;
        {
            let mut state = shared.state.lock();
            state.ready = ready;
            state.refresh_queued = false;
        }
        debug!(ready, "Readiness refreshed");

        if (shared.alive)() {
            schedule_refresh(&shared, shared.check_interval);
        } else {
            debug!("Disk is gone, readiness refresh stopped");
        }
    });
}

#[async_trait]
impl DiskReadiness for CachedReadiness {
    async fn is_ready(&self) -> bool {
        let ready = self.cached();
        // Re-validate a ready disk after the cool-down, retry a failed one now
        let delay = if ready {
            self.shared.check_interval
        } else {
            Duration::ZERO
        };
        schedule_refresh(&self.shared, delay);
        ready
    }

    async fn is_ready_force(&self) -> bool {
        let ready = (self.shared.probe)().await;
        self.shared.state.lock().ready = ready;
        ready
    }

    async fn is_ready_force_non_blocking(&self) -> bool {
        let weak = Arc::downgrade(&self.shared);
        let delay = self.shared.non_blocking_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let ready = (shared.probe)().await;
            shared.state.lock().ready = ready;
        });
        self.cached()
    }
}

/// Readiness of a composite disk: ready iff every member is ready
pub struct VirtualDiskReadiness {
    members: Vec<Arc<dyn DiskReadiness>>,
}

impl VirtualDiskReadiness {
    #[must_use]
    pub fn new(members: impl IntoIterator<Item = Arc<dyn DiskReadiness>>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DiskReadiness for VirtualDiskReadiness {
    async fn is_ready(&self) -> bool {
        for member in &self.members {
            if !member.is_ready().await {
                return false;
            }
        }
        true
    }

    async fn is_ready_force(&self) -> bool {
        for member in &self.members {
            if !member.is_ready_force().await {
                return false;
            }
        }
        true
    }

    async fn is_ready_force_non_blocking(&self) -> bool {
        for member in &self.members {
            if !member.is_ready_force_non_blocking().await {
                return false;
            }
        }
        true
    }
}

/// Fixed readiness, for disks that cannot be probed yet
pub struct StaticReadiness(pub bool);

#[async_trait]
impl DiskReadiness for StaticReadiness {
    async fn is_ready(&self) -> bool {
        self.0
    }

    async fn is_ready_force(&self) -> bool {
        self.0
    }

    async fn is_ready_force_non_blocking(&self) -> bool {
        self.0
    }
}
