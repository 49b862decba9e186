//! Replica manager module implementation.
//!
//! Creates and tracks replicas of local in-memory segments on remote
//! backups. The master's log issues requests through `SegmentHandle`s; all
//! operations are only queued, and `proceed()` casually advances replication
//! whenever called. `sync()` is the cooperative barrier that repeatedly
//! proceeds until the requested bytes are durable on every replica. The
//! manager masks all failures that can occur in replication (naming,
//! network, or host failures) by restarting affected replicas on freshly
//! selected backups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use serde::Deserialize;

use crate::cluster::{ServerId, ServerList, ServerTracker};
use crate::rpc::{BackupClient, BackupReply, RpcError, RpcId, RpcTracker};
use crate::segment::{DriverCtx, ReplicatedSegment};
use crate::selector::{BackupSelector, BackupStats};
use crate::task::TaskQueue;
use crate::utils::MemRepError;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MasterConfig {
    /// Number of replicas to keep of each segment. Zero disables
    /// replication (useful for single-node testing).
    pub num_replicas: u32,

    /// Admission cap on collective in-flight write-class RPCs (opens and
    /// writes; frees are exempt).
    pub max_write_rpcs_in_flight: u32,

    /// Number of candidates sampled per primary placement choice.
    pub power_of_k_choices: u32,

    /// Transport payload cap for one write chunk, in bytes.
    pub max_write_chunk_bytes: usize,

    /// Transport-level deadline for each backup RPC, in milliseconds.
    pub rpc_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            num_replicas: 3,
            max_write_rpcs_in_flight: 4,
            power_of_k_choices: 5,
            max_write_chunk_bytes: 1 << 20,
            rpc_timeout_ms: 500,
        }
    }
}

/// One arena slot for a replicated segment. The generation grows every time
/// the slot is reallocated so stale handles and RPC completions miss.
struct SegmentSlot {
    gen: u64,
    seg: Option<ReplicatedSegment>,
}

/// All replica manager state, protected by the manager's single mutex.
struct ManagerInner {
    /// Dense arena of replicated segments.
    slots: Vec<SegmentSlot>,

    /// Free list of arena slots for fast reuse.
    free_slots: Vec<usize>,

    /// Slot of the most recently opened, still-live segment; new segments
    /// link after it.
    newest_open: Option<usize>,

    /// Scheduler of segments whose state may advance.
    queue: TaskQueue,

    /// Placement policy, feeding off the manager's tracker.
    selector: BackupSelector,

    /// Fire-and-track RPC issuer.
    rpcs: RpcTracker,

    /// Receiver side of the RPC completion channel.
    rx_done: mpsc::UnboundedReceiver<(RpcId, Result<BackupReply, RpcError>)>,

    /// Collective count of in-flight write-class RPCs to all backups.
    write_rpcs_in_flight: u32,
}

/// Creates and tracks replicas of local in-memory segments on remote
/// backups. There must be exactly one replica manager per log.
pub struct ReplicaManager {
    /// Id of the master this manages replicas for.
    me: ServerId,

    /// Configuration parameters struct.
    config: MasterConfig,

    /// The manager's server tracker; annotations hold per-backup stats
    /// owned by the selector.
    tracker: Arc<Mutex<ServerTracker<BackupStats>>>,

    /// Everything the single manager mutex protects.
    inner: Mutex<ManagerInner>,

    /// Process shutdown flag; aborts pending `sync()`s.
    shutdown: AtomicBool,
}

impl ReplicaManager {
    /// Creates a new replica manager, registering its tracker with the
    /// local server list.
    pub fn new_and_setup(
        me: ServerId,
        config: MasterConfig,
        server_list: &ServerList,
        backup_client: Arc<dyn BackupClient>,
    ) -> Result<Arc<Self>, MemRepError> {
        if config.max_write_rpcs_in_flight == 0 {
            return logged_err!(me; "invalid config.max_write_rpcs_in_flight '0'");
        }
        if config.power_of_k_choices == 0 {
            return logged_err!(me; "invalid config.power_of_k_choices '0'");
        }
        if config.max_write_chunk_bytes == 0 {
            return logged_err!(me; "invalid config.max_write_chunk_bytes '0'");
        }
        if config.rpc_timeout_ms == 0 {
            return logged_err!(me; "invalid config.rpc_timeout_ms '0'");
        }

        let tracker = Arc::new(Mutex::new(ServerTracker::new()));
        server_list.register(tracker.clone());

        let (tx_done, rx_done) = mpsc::unbounded_channel();
        let selector =
            BackupSelector::new(tracker.clone(), config.power_of_k_choices);
        let rpcs = RpcTracker::new(
            me,
            backup_client,
            Duration::from_millis(config.rpc_timeout_ms),
            tx_done,
        );

        Ok(Arc::new(ReplicaManager {
            me,
            config,
            tracker,
            inner: Mutex::new(ManagerInner {
                slots: vec![],
                free_slots: vec![],
                newest_open: None,
                queue: TaskQueue::new(),
                selector,
                rpcs,
                rx_done,
                write_rpcs_in_flight: 0,
            }),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Number of replicas kept of each segment.
    pub fn num_replicas(&self) -> u32 {
        self.config.num_replicas
    }

    /// Makes the manager aware of an in-memory segment which must be
    /// replicated, linking it after the previously opened segment. Never
    /// suspends; replication work is queued and advanced by `proceed()`.
    pub fn open_segment(
        self: &Arc<Self>,
        segment_id: u64,
        data: &[u8],
        open_len: usize,
    ) -> Result<SegmentHandle, MemRepError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return logged_err!(self.me; "open_segment after shutdown");
        }
        if open_len > data.len() {
            return logged_err!(
                self.me;
                "open_len {} exceeds data length {}",
                open_len,
                data.len()
            );
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.slots.iter().any(|s| {
            s.seg
                .as_ref()
                .map(|seg| seg.segment_id == segment_id)
                .unwrap_or(false)
        }) {
            return logged_err!(self.me; "segment {} already open", segment_id);
        }

        let prev = inner.newest_open;
        let slot = match inner.free_slots.pop() {
            Some(slot) => {
                inner.slots[slot].gen += 1;
                slot
            }
            None => {
                inner.slots.push(SegmentSlot { gen: 0, seg: None });
                inner.slots.len() - 1
            }
        };

        let seg = ReplicatedSegment::new(
            segment_id,
            data,
            open_len,
            self.config.num_replicas,
            prev,
        );
        let gen = inner.slots[slot].gen;
        inner.slots[slot].seg = Some(seg);
        if let Some(prev_slot) = prev {
            if let Some(prev_seg) = inner.slots[prev_slot].seg.as_mut() {
                prev_seg.next = Some(slot);
            }
        }
        inner.newest_open = Some(slot);
        inner.queue.schedule(slot);

        pf_debug!(self.me; "opened segment {} at slot {}.{}", segment_id, slot, gen);
        Ok(SegmentHandle {
            mgr: self.clone(),
            slot,
            gen,
            segment_id,
        })
    }

    /// Drains RPC completions and tracker changes, then runs one scheduler
    /// round. Never blocks on I/O; it only initiates RPCs and polls their
    /// completions.
    pub fn proceed(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.proceed_locked(&mut inner);
    }

    /// Repeatedly proceeds until the scheduler reaches quiescence.
    pub fn proceed_all(&self) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            self.proceed_locked(&mut inner);
            if inner.queue.is_idle() {
                break;
            }
        }
    }

    /// Flushes the scheduler once and abandons any still-outstanding RPCs.
    /// Pending `sync()`s abort with an error.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        self.proceed_locked(&mut inner);
        pf_info!(
            self.me;
            "shut down with {} rpcs abandoned",
            inner.rpcs.num_outstanding()
        );
    }

    fn proceed_locked(&self, inner: &mut ManagerInner) {
        let mut freed_capacity = false;

        // apply RPC completions received since the last round
        while let Ok((rpc_id, result)) = inner.rx_done.try_recv() {
            let Some(ctx) = inner.rpcs.complete(rpc_id) else {
                continue;
            };
            if ctx.kind.counts_against_cap() {
                inner.write_rpcs_in_flight -= 1;
                freed_capacity = true;
            }

            if inner.slots[ctx.slot].gen != ctx.slot_gen {
                continue; // slot recycled since issue
            }
            let backup_still_listed =
                self.tracker.lock().unwrap().contains(ctx.backup);
            let Some(seg) = inner.slots[ctx.slot].seg.as_mut() else {
                continue;
            };
            let reached_quorum = seg.apply_rpc_result(
                ctx.replica,
                rpc_id,
                ctx.kind,
                result,
                backup_still_listed,
            );
            let next = seg.next;
            inner.queue.schedule(ctx.slot);
            if reached_quorum {
                if let Some(next_slot) = next {
                    inner.queue.schedule(next_slot);
                }
            }
        }

        // fold membership changes in: fresh backups lift starvation, lost
        // backups invalidate their replicas
        let added = match inner.selector.apply_tracker_changes() {
            Ok(added) => added,
            Err(e) => {
                pf_error!(self.me; "error applying tracker changes: {}", e);
                0
            }
        };
        for backup in inner.selector.take_failed_backups() {
            pf_warn!(self.me; "backup {} lost, re-replicating its segments", backup);
            for slot in 0..inner.slots.len() {
                let Some(seg) = inner.slots[slot].seg.as_mut() else {
                    continue;
                };
                if seg.handle_backup_failure(backup) {
                    inner.queue.schedule(slot);
                }
            }
        }
        if added > 0 || freed_capacity {
            for slot in 0..inner.slots.len() {
                if inner.slots[slot].seg.is_some() {
                    inner.queue.schedule(slot);
                }
            }
        }

        // one fair FIFO round over scheduled segments
        for slot in inner.queue.take_round() {
            let predecessor_closed = {
                let Some(seg) = inner.slots[slot].seg.as_ref() else {
                    continue;
                };
                match seg.prev {
                    None => true,
                    Some(prev_slot) => match inner.slots[prev_slot]
                        .seg
                        .as_ref()
                    {
                        Some(prev_seg) => {
                            prev_seg.is_freed() || prev_seg.closed_quorum()
                        }
                        None => true, // predecessor already destroyed
                    },
                }
            };

            let fully_freed = {
                let ManagerInner {
                    slots,
                    selector,
                    rpcs,
                    write_rpcs_in_flight,
                    ..
                } = &mut *inner;
                let slot_gen = slots[slot].gen;
                let seg = slots[slot].seg.as_mut().unwrap();
                let mut ctx = DriverCtx {
                    selector,
                    rpcs,
                    write_rpcs_in_flight,
                    max_write_rpcs_in_flight: self
                        .config
                        .max_write_rpcs_in_flight,
                    max_chunk: self.config.max_write_chunk_bytes,
                    slot,
                    slot_gen,
                    predecessor_closed,
                };
                seg.perform(&mut ctx)
            };
            if fully_freed {
                self.destroy_and_free(inner, slot);
            }
        }
    }

    /// Tears down a replicated segment that has reached full-FREED,
    /// relinking its neighbors and recycling its arena slot.
    fn destroy_and_free(&self, inner: &mut ManagerInner, slot: usize) {
        let Some(seg) = inner.slots[slot].seg.take() else {
            return;
        };
        pf_debug!(self.me; "destroying freed segment {}", seg.segment_id);

        if let Some(prev_slot) = seg.prev {
            if let Some(prev_seg) = inner.slots[prev_slot].seg.as_mut() {
                prev_seg.next = seg.next;
            }
        }
        if let Some(next_slot) = seg.next {
            if let Some(next_seg) = inner.slots[next_slot].seg.as_mut() {
                next_seg.prev = seg.prev;
            }
            // the successor's ordering gate may have changed
            inner.queue.schedule(next_slot);
        }
        if inner.newest_open == Some(slot) {
            inner.newest_open = seg.prev;
        }

        inner.queue.forget(slot);
        inner.free_slots.push(slot);
    }

    /// Number of live (not yet destroyed) segments.
    #[cfg(test)]
    pub(crate) fn num_live_segments(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|s| s.seg.is_some()).count()
    }

    /// Instantaneous count of in-flight write-class RPCs.
    #[cfg(test)]
    pub(crate) fn write_rpcs_in_flight(&self) -> u32 {
        self.inner.lock().unwrap().write_rpcs_in_flight
    }
}

/// The log's non-owning handle onto one replicated segment, valid until
/// `free()`.
pub struct SegmentHandle {
    mgr: Arc<ReplicaManager>,
    slot: usize,
    gen: u64,
    segment_id: u64,
}

impl SegmentHandle {
    /// Log-assigned id of the segment.
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    fn with_segment<R>(
        &self,
        inner: &mut ManagerInner,
        op: impl FnOnce(&mut ReplicatedSegment) -> R,
    ) -> Result<R, MemRepError> {
        if inner.slots[self.slot].gen != self.gen {
            return Err(MemRepError(format!(
                "segment {} no longer live",
                self.segment_id
            )));
        }
        match inner.slots[self.slot].seg.as_mut() {
            Some(seg) => Ok(op(seg)),
            None => Err(MemRepError(format!(
                "segment {} no longer live",
                self.segment_id
            ))),
        }
    }

    /// Extends the segment's committed image with bytes the log promises
    /// are stable in memory.
    pub fn append(&self, bytes: &[u8]) -> Result<(), MemRepError> {
        let mut inner = self.mgr.inner.lock().unwrap();
        self.with_segment(&mut inner, |seg| seg.append(bytes))?;
        inner.queue.schedule(self.slot);
        Ok(())
    }

    /// Seals the segment; no further appends are meaningful. Idempotent.
    pub fn close(&self) -> Result<(), MemRepError> {
        let mut inner = self.mgr.inner.lock().unwrap();
        self.with_segment(&mut inner, |seg| seg.queue_close())?;
        inner.queue.schedule(self.slot);
        Ok(())
    }

    /// Cooperatively blocks until every replica has acknowledged at least
    /// `len` bytes (and, once the segment is closed and `len` covers it,
    /// until every replica is durably sealed). Progress is preserved under
    /// backup churn: the barrier repeatedly proceeds the scheduler and
    /// yields.
    pub async fn sync(&self, len: usize) -> Result<(), MemRepError> {
        loop {
            {
                if self.mgr.shutdown.load(Ordering::SeqCst) {
                    return logged_err!(
                        self.mgr.me;
                        "sync aborted by shutdown"
                    );
                }
                let mut inner = self.mgr.inner.lock().unwrap();
                self.mgr.proceed_locked(&mut inner);
                let (committed, synced) =
                    self.with_segment(&mut inner, |seg| {
                        (seg.committed(), seg.synced_to(len))
                    })?;
                if len > committed {
                    return logged_err!(
                        self.mgr.me;
                        "sync length {} beyond committed {}",
                        len,
                        committed
                    );
                }
                if synced {
                    return Ok(());
                }
            }
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Marks the segment freed and consumes the handle. Permitted while
    /// replicas are mid-write; the segment destroys itself once every
    /// replica's frame is discarded.
    pub fn free(self) -> Result<(), MemRepError> {
        let mut inner = self.mgr.inner.lock().unwrap();
        self.with_segment(&mut inner, |seg| seg.queue_free())?;
        inner.queue.schedule(self.slot);
        Ok(())
    }
}
