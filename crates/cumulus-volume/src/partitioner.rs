//! Block placement
//!
//! A partitioner keeps only its strategy state, such as the round-robin
//! cursor. The free space it places against is handed in with every call as
//! a slice of [`Candidate`]s; assigned bytes are deducted from that slice, so
//! a file split into many blocks never overcommits a disk while the next file
//! starts from freshly measured space. The volume rebuilds its partitioner
//! whenever the disk set changes.

use chrono::{DateTime, Utc};
use cumulus_common::PartitionStrategy;
use cumulus_disk::{Disk, compute_free_space, measure_throughput};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// A placement disk as seen by a partitioner
#[derive(Clone)]
pub struct Candidate {
    pub disk: Arc<dyn Disk>,
    /// Bytes the disk can still accept
    pub free_space: u64,
    /// Measured throughput weight, lower is faster
    pub weight: u64,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Candidate with the given free space and a neutral weight
    #[must_use]
    pub fn new(disk: Arc<dyn Disk>, free_space: u64) -> Self {
        let created_at = disk.created_at();
        Self {
            disk,
            free_space,
            weight: 1,
            created_at,
        }
    }

    /// Measure every disk concurrently
    ///
    /// Throughput is only probed for the strategy that uses it, with a sample
    /// of `sample_size` bytes.
    pub async fn collect(
        disks: Vec<Arc<dyn Disk>>,
        strategy: PartitionStrategy,
        sample_size: u64,
    ) -> Vec<Self> {
        join_all(disks.into_iter().map(|disk| async move {
            let free_space = compute_free_space(disk.as_ref()).await;
            let weight = match strategy {
                PartitionStrategy::Throughput => measure_throughput(disk.as_ref(), sample_size).await,
                PartitionStrategy::Balanced | PartitionStrategy::Priority => 1,
            };
            Self {
                weight,
                ..Self::new(disk, free_space)
            }
        }))
        .await
    }

    /// Same candidates with their free space measured again
    ///
    /// Weights are kept.
    pub async fn refreshed(candidates: &[Self]) -> Vec<Self> {
        join_all(candidates.iter().map(|candidate| async move {
            Self {
                free_space: compute_free_space(candidate.disk.as_ref()).await,
                ..candidate.clone()
            }
        }))
        .await
    }

    const fn fits(&self, size: u64) -> bool {
        self.free_space >= size
    }
}

/// Picks the disk that receives the next block
pub trait Partitioner: Send + Sync {
    /// Disk for a block of `size` bytes, `None` if no candidate has room
    ///
    /// The picked candidate's free space is reduced by `size`.
    fn assign_disk(&self, candidates: &mut [Candidate], size: u64) -> Option<Arc<dyn Disk>>;
}

/// Build the partitioner of `strategy`
#[must_use]
pub fn build(strategy: PartitionStrategy) -> Arc<dyn Partitioner> {
    debug!("Building {:?} partitioner", strategy);
    match strategy {
        PartitionStrategy::Balanced => Arc::new(BalancedPartitioner::new()),
        PartitionStrategy::Priority => Arc::new(FitnessPartitioner::priority()),
        PartitionStrategy::Throughput => Arc::new(FitnessPartitioner::throughput()),
    }
}

/// Round-robin placement
///
/// The k-th call returns the disk at `(start + k) mod N` among the disks with
/// room for the block, where `start` is 0 on construction. The cursor indexes
/// the candidate slice, so callers pass the disks in the same order each time.
#[derive(Default)]
pub struct BalancedPartitioner {
    last: Mutex<usize>,
}

impl BalancedPartitioner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for BalancedPartitioner {
    fn assign_disk(&self, candidates: &mut [Candidate], size: u64) -> Option<Arc<dyn Disk>> {
        let count = candidates.len();
        if count == 0 {
            return None;
        }

        let mut last = self.last.lock();
        let index = (1..=count)
            .map(|step| (*last + step) % count)
            .find(|&index| candidates[index].fits(size))?;

        *last = index;
        let candidate = &mut candidates[index];
        candidate.free_space -= size;
        Some(Arc::clone(&candidate.disk))
    }
}

/// Scores a candidate; the highest score wins
pub type Fitness = Arc<dyn Fn(&Candidate) -> i128 + Send + Sync>;

/// Placement on the fittest disk with room for the block
///
/// Ties go to the older disk.
pub struct FitnessPartitioner {
    fitness: Fitness,
}

impl FitnessPartitioner {
    #[must_use]
    pub const fn new(fitness: Fitness) -> Self {
        Self { fitness }
    }

    /// Most free space first
    #[must_use]
    pub fn priority() -> Self {
        Self::new(Arc::new(|candidate: &Candidate| {
            i128::from(candidate.free_space)
        }))
    }

    /// Most free space per unit of throughput weight first
    #[must_use]
    pub fn throughput() -> Self {
        Self::new(Arc::new(|candidate: &Candidate| {
            i128::from(candidate.free_space) * 1000 / i128::from(candidate.weight.max(1))
        }))
    }
}

impl Partitioner for FitnessPartitioner {
    fn assign_disk(&self, candidates: &mut [Candidate], size: u64) -> Option<Arc<dyn Disk>> {
        let index = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.fits(size))
            .max_by(|(_, a), (_, b)| {
                (self.fitness)(*a)
                    .cmp(&(self.fitness)(*b))
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|(index, _)| index)?;

        let candidate = &mut candidates[index];
        candidate.free_space -= size;
        Some(Arc::clone(&candidate.disk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cumulus_common::config::ReadinessConfig;
    use cumulus_common::{DiskId, DiskRecord, ProviderRecord, ProviderType, UserId, VolumeId};
    use cumulus_disk::{DiskCore, MemoryDisk, MemoryStore};
    use std::time::Duration;

    const BLOCK: u64 = 8;

    fn disk(total: u64) -> Arc<dyn Disk> {
        Arc::new(MemoryDisk::new(VolumeId::new(), "m", total))
    }

    fn aged_disk(total: u64, age_hours: i64) -> Arc<dyn Disk> {
        let record = DiskRecord {
            id: DiskId::new(),
            user_id: UserId::new(),
            volume_id: VolumeId::new(),
            provider_id: ProviderRecord::for_type(ProviderType::Memory).id,
            credentials: String::new(),
            name: format!("aged-{age_hours}"),
            total_space: total,
            used_space: 0,
            created_at: Utc::now() - ChronoDuration::hours(age_hours),
            is_virtual: false,
            virtual_disk_id: None,
        };
        let core = DiskCore::from_record(&record, ProviderType::Memory).unwrap();
        Arc::new(MemoryDisk::with_core(
            core,
            Arc::new(MemoryStore::default()),
            &ReadinessConfig::default(),
        ))
    }

    fn candidates(disks: &[Arc<dyn Disk>]) -> Vec<Candidate> {
        disks
            .iter()
            .map(|d| Candidate::new(Arc::clone(d), d.total_space()))
            .collect()
    }

    fn picks(partitioner: &dyn Partitioner, snapshot: &mut [Candidate], calls: usize) -> Vec<DiskId> {
        (0..calls)
            .map(|_| partitioner.assign_disk(snapshot, BLOCK).unwrap().id())
            .collect()
    }

    #[test]
    fn test_balanced_rotates_starting_after_first_disk() {
        let disks = vec![disk(1000), disk(1000), disk(1000)];
        let partitioner = BalancedPartitioner::new();

        let ids: Vec<DiskId> = disks.iter().map(|d| d.id()).collect();
        assert_eq!(
            picks(&partitioner, &mut candidates(&disks), 6),
            vec![ids[1], ids[2], ids[0], ids[1], ids[2], ids[0]]
        );
    }

    #[test]
    fn test_balanced_cursor_survives_fresh_snapshots() {
        let disks = vec![disk(1000), disk(1000), disk(1000)];
        let partitioner = BalancedPartitioner::new();
        let ids: Vec<DiskId> = disks.iter().map(|d| d.id()).collect();

        assert_eq!(picks(&partitioner, &mut candidates(&disks), 2), vec![ids[1], ids[2]]);
        assert_eq!(picks(&partitioner, &mut candidates(&disks), 2), vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_balanced_splits_evenly() {
        let disks = vec![disk(1000), disk(1000)];
        let picked = picks(&BalancedPartitioner::new(), &mut candidates(&disks), 9);
        let first = picked.iter().filter(|id| **id == disks[0].id()).count();
        assert_eq!(first, 4);
        assert_eq!(picked.len() - first, 5);
    }

    #[test]
    fn test_balanced_skips_full_disks() {
        let disks = vec![disk(1000), disk(4), disk(1000)];
        let picked = picks(&BalancedPartitioner::new(), &mut candidates(&disks), 4);
        assert!(!picked.contains(&disks[1].id()));
        assert_eq!(picked, vec![disks[2].id(), disks[0].id(), disks[2].id(), disks[0].id()]);
    }

    #[test]
    fn test_empty_or_full_volume_has_no_placement() {
        assert!(BalancedPartitioner::new().assign_disk(&mut [], BLOCK).is_none());
        assert!(FitnessPartitioner::priority().assign_disk(&mut [], BLOCK).is_none());

        let full = vec![disk(4), disk(4)];
        assert!(BalancedPartitioner::new().assign_disk(&mut candidates(&full), BLOCK).is_none());
        assert!(FitnessPartitioner::priority().assign_disk(&mut candidates(&full), BLOCK).is_none());
    }

    #[test]
    fn test_assignments_consume_snapshot_space() {
        let disks = vec![disk(2 * BLOCK)];
        let partitioner = BalancedPartitioner::new();
        let mut snapshot = candidates(&disks);
        assert!(partitioner.assign_disk(&mut snapshot, BLOCK).is_some());
        assert!(partitioner.assign_disk(&mut snapshot, BLOCK).is_some());
        assert!(partitioner.assign_disk(&mut snapshot, BLOCK).is_none());

        // A new snapshot starts from the disk's real free space again
        assert!(partitioner.assign_disk(&mut candidates(&disks), BLOCK).is_some());
    }

    #[test]
    fn test_priority_prefers_most_free_space() {
        let old_small = aged_disk(2 * BLOCK, 2);
        let young_roomy = aged_disk(1_000_000, 0);
        let partitioner = FitnessPartitioner::priority();
        let mut snapshot = candidates(&[old_small.clone(), young_roomy.clone()]);

        assert_eq!(picks(&partitioner, &mut snapshot, 3), vec![young_roomy.id(); 3]);
        assert!(partitioner.assign_disk(&mut snapshot, 2_000_000).is_none());
    }

    #[test]
    fn test_priority_breaks_ties_by_age() {
        let old = aged_disk(3 * BLOCK, 2);
        let young = aged_disk(3 * BLOCK, 0);
        let partitioner = FitnessPartitioner::priority();
        let mut snapshot = candidates(&[young.clone(), old.clone()]);

        // Each pick shrinks the chosen disk, so equal disks alternate
        assert_eq!(
            picks(&partitioner, &mut snapshot, 4),
            vec![old.id(), young.id(), old.id(), young.id()]
        );
    }

    #[test]
    fn test_throughput_prefers_fast_disks() {
        let slow = disk(1000);
        let fast = disk(1000);
        let mut snapshot = candidates(&[slow.clone(), fast.clone()]);
        snapshot[0].weight = 100;
        snapshot[1].weight = 10;
        let partitioner = FitnessPartitioner::throughput();
        assert_eq!(partitioner.assign_disk(&mut snapshot, BLOCK).unwrap().id(), fast.id());
    }

    #[tokio::test]
    async fn test_refreshed_snapshot_sees_released_space() {
        let memory = Arc::new(MemoryDisk::new(VolumeId::new(), "m", 100));
        let disks: Vec<Arc<dyn Disk>> = vec![memory.clone()];
        let mut snapshot = Candidate::collect(disks, PartitionStrategy::Balanced, BLOCK).await;
        snapshot[0].weight = 7;

        memory.update_used_space(60).await.unwrap();
        let refreshed = Candidate::refreshed(&snapshot).await;
        assert_eq!(refreshed[0].free_space, 40);
        assert_eq!(refreshed[0].weight, 7);

        memory.update_used_space(-60).await.unwrap();
        assert_eq!(Candidate::refreshed(&snapshot).await[0].free_space, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_measures_throughput_only_when_needed() {
        let slow = MemoryDisk::new(VolumeId::new(), "slow", 1000);
        slow.set_latency(Duration::from_millis(20));
        let disks: Vec<Arc<dyn Disk>> = vec![Arc::new(slow)];

        let balanced = Candidate::collect(disks.clone(), PartitionStrategy::Balanced, BLOCK).await;
        assert_eq!(balanced[0].weight, 1);
        assert_eq!(balanced[0].free_space, 1000);

        let weighted = Candidate::collect(disks, PartitionStrategy::Throughput, BLOCK).await;
        assert_eq!(weighted[0].weight, 21);
    }
}
