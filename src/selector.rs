//! Backup selection (replica placement) module implementation.
//!
//! Tracks per-backup load statistics through annotations on the replica
//! manager's server tracker and picks a backup for each new replica while
//! obeying placement constraints: a segment never stores two replicas on the
//! same backup, and primaries of the same master spread across distinct
//! backups whenever the cluster is large enough.

use std::sync::{Arc, Mutex};

use crate::cluster::{ServerId, ServerTracker, ServiceMask, ServerChangeEvent};
use crate::utils::MemRepError;

/// How many placement attempts to make before relaxing the primary
/// uniqueness constraint (and again before giving up on sampling).
const MAX_PLACEMENT_ATTEMPTS: usize = 20;

/// Load statistics tracked for one backup, stored as the tracker annotation
/// of its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackupStats {
    /// Number of primary replicas this master has stored on the backup.
    pub primary_replica_count: u32,

    /// Advertised disk read bandwidth of the backup in MB/s.
    pub expected_read_mbytes_per_sec: u32,
}

impl BackupStats {
    /// Milliseconds a recovery is expected to spend reading this master's
    /// primary replicas off the backup, were one more segment placed there.
    fn expected_read_ms(&self, segment_bytes: usize) -> u64 {
        let speed = self.expected_read_mbytes_per_sec.max(1) as u64;
        (self.primary_replica_count as u64 * segment_bytes as u64)
            / (speed * 1000)
    }
}

/// Placement seam used by replicated segments; lets tests substitute a
/// scripted placement policy.
pub trait Selector: Send {
    /// Picks a backup for a primary replica of a segment of the given size,
    /// avoiding the backups in `exclude`.
    fn choose_primary(
        &mut self,
        exclude: &[ServerId],
        segment_bytes: usize,
    ) -> Option<ServerId>;

    /// Picks a backup for a secondary replica, avoiding the backups in
    /// `exclude`.
    fn choose_secondary(&mut self, exclude: &[ServerId]) -> Option<ServerId>;
}

/// The production backup selector.
pub struct BackupSelector {
    /// The replica manager's server tracker; annotations hold `BackupStats`.
    tracker: Arc<Mutex<ServerTracker<BackupStats>>>,

    /// Number of candidates sampled per power-of-k choice.
    power_of_k: u32,

    /// Backups observed `Removed` while draining tracker changes, awaiting
    /// pickup by the replica manager for re-replication.
    pending_failures: Vec<ServerId>,
}

impl BackupSelector {
    /// Creates a new selector over the given tracker.
    pub fn new(
        tracker: Arc<Mutex<ServerTracker<BackupStats>>>,
        power_of_k: u32,
    ) -> Self {
        BackupSelector {
            tracker,
            power_of_k,
            pending_failures: vec![],
        }
    }

    /// Drains pending tracker changes: annotates fresh stats for added
    /// backups and clears the annotation of removed ones (per the tracker's
    /// contract), buffering removed backups for the replica manager.
    /// Returns the number of backups added.
    pub fn apply_tracker_changes(&mut self) -> Result<usize, MemRepError> {
        let mut tracker = self.tracker.lock().unwrap();
        let mut added = 0;
        while let Some((details, event)) = tracker.get_change() {
            if !details.services.has(ServiceMask::BACKUP) {
                continue;
            }
            match event {
                ServerChangeEvent::Added => {
                    *tracker.annotation_mut(details.server_id)? =
                        Some(BackupStats {
                            primary_replica_count: 0,
                            expected_read_mbytes_per_sec: details.user_data
                                as u32,
                        });
                    added += 1;
                }
                ServerChangeEvent::Removed => {
                    *tracker.annotation_mut(details.server_id)? = None;
                    self.pending_failures.push(details.server_id);
                }
            }
        }
        Ok(added)
    }

    /// Hands over the backups seen removed since the last call.
    pub fn take_failed_backups(&mut self) -> Vec<ServerId> {
        std::mem::take(&mut self.pending_failures)
    }

    /// Power-of-k sample over present backups, minimizing expected read
    /// time. Returns the invalid id if no backup is present at all.
    fn sample_best(
        tracker: &ServerTracker<BackupStats>,
        power_of_k: u32,
        segment_bytes: usize,
    ) -> ServerId {
        let mut best = ServerId::INVALID;
        let mut best_score = u64::MAX;
        for _ in 0..power_of_k {
            let id = tracker.random_with_service(ServiceMask::BACKUP);
            if !id.is_valid() {
                break;
            }
            let score = match tracker.annotation(id) {
                Ok(Some(stats)) => stats.expected_read_ms(segment_bytes),
                _ => continue,
            };
            if !best.is_valid() || score < best_score {
                best = id;
                best_score = score;
            }
        }
        best
    }

    /// Whether placing another primary of this master on `id` would collide
    /// with one already there.
    fn hosts_our_primary(
        tracker: &ServerTracker<BackupStats>,
        id: ServerId,
    ) -> bool {
        matches!(
            tracker.annotation(id),
            Ok(Some(stats)) if stats.primary_replica_count > 0
        )
    }
}

impl Selector for BackupSelector {
    fn choose_primary(
        &mut self,
        exclude: &[ServerId],
        segment_bytes: usize,
    ) -> Option<ServerId> {
        for relaxed in [false, true] {
            for _ in 0..MAX_PLACEMENT_ATTEMPTS {
                // changes may land while we retry; observe them as we go
                if self.apply_tracker_changes().is_err() {
                    continue;
                }
                let mut tracker = self.tracker.lock().unwrap();
                let id = Self::sample_best(
                    &tracker,
                    self.power_of_k,
                    segment_bytes,
                );
                if !id.is_valid() {
                    return None; // no backup present at all
                }
                if exclude.contains(&id) {
                    continue;
                }
                if !relaxed && Self::hosts_our_primary(&tracker, id) {
                    continue;
                }
                if let Ok(Some(stats)) = tracker.annotation_mut(id) {
                    stats.primary_replica_count += 1;
                }
                return Some(id);
            }
            if !relaxed {
                pf_warn!(
                    "selector";
                    "relaxing primary placement constraint after {} attempts",
                    MAX_PLACEMENT_ATTEMPTS
                );
            }
        }

        // sampling missed; deterministically take any eligible backup so we
        // never report starvation while one exists
        let mut tracker = self.tracker.lock().unwrap();
        let fallback = tracker
            .iter()
            .filter(|d| d.services.has(ServiceMask::BACKUP))
            .map(|d| d.server_id)
            .find(|id| !exclude.contains(id));
        if let Some(id) = fallback {
            if let Ok(Some(stats)) = tracker.annotation_mut(id) {
                stats.primary_replica_count += 1;
            }
        }
        fallback
    }

    fn choose_secondary(&mut self, exclude: &[ServerId]) -> Option<ServerId> {
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            if self.apply_tracker_changes().is_err() {
                continue;
            }
            let tracker = self.tracker.lock().unwrap();
            let id = tracker.random_with_service(ServiceMask::BACKUP);
            if !id.is_valid() {
                return None;
            }
            if !exclude.contains(&id) {
                return Some(id);
            }
        }

        let tracker = self.tracker.lock().unwrap();
        let result = tracker
            .iter()
            .filter(|d| d.services.has(ServiceMask::BACKUP))
            .map(|d| d.server_id)
            .find(|id| !exclude.contains(id));
        result
    }
}
