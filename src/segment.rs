//! Replicated segment state machine module implementation.
//!
//! One instance exists per open/not-yet-freed segment of the master's log.
//! The log feeds the segment its byte image (monotonically growing committed
//! prefix) and, eventually, a close; the segment drives each of its replica
//! slots independently toward consistency with that target, restarting a
//! slot from scratch whenever its backup fails or departs the cluster.

use bytes::{Bytes, BytesMut};

use crate::cluster::ServerId;
use crate::rpc::{BackupReply, BackupRpcKind, RpcError, RpcId, RpcTracker};
use crate::selector::Selector;

/// Replication progress of one replica slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicaState {
    /// No backup chosen (or the previous one was lost).
    Unassigned,

    /// Open RPC in flight.
    Opening,

    /// Open acknowledged; cursor covers the open bytes.
    OpenAcked,

    /// Write RPC in flight.
    Writing,

    /// Latest write acknowledged.
    WriteAcked,

    /// Sealing write RPC in flight.
    Closing,

    /// Replica sealed on its backup.
    Closed,

    /// Free RPC in flight.
    Freeing,

    /// Replica discarded; terminal.
    Freed,
}

/// One replica slot of a segment.
#[derive(Debug)]
pub(crate) struct Replica {
    /// Current progress of this slot.
    pub(crate) state: ReplicaState,

    /// Backup hosting the replica; invalid while unassigned.
    pub(crate) backup: ServerId,

    /// Role of the slot. Slot 0 replicates as the primary; the role
    /// survives re-replication after a backup loss.
    pub(crate) is_primary: bool,

    /// Bytes acknowledged by the backup. Never exceeds the segment's
    /// committed length.
    pub(crate) cursor: usize,

    /// In-flight RPC for this slot, if any. Completions carrying a stale id
    /// are discarded.
    pub(crate) rpc: Option<RpcId>,
}

impl Replica {
    fn new(is_primary: bool) -> Self {
        Replica {
            state: ReplicaState::Unassigned,
            backup: ServerId::INVALID,
            is_primary,
            cursor: 0,
            rpc: None,
        }
    }

    /// Releases the slot's backup and restarts replication from scratch.
    /// The segment's committed image has not receded, so the replacement
    /// catches up without loss.
    fn reset(&mut self) {
        self.state = ReplicaState::Unassigned;
        self.backup = ServerId::INVALID;
        self.cursor = 0;
        self.rpc = None;
    }
}

/// Borrowed manager machinery a segment needs while being performed.
pub(crate) struct DriverCtx<'a> {
    /// Placement policy for unassigned slots.
    pub(crate) selector: &'a mut dyn Selector,

    /// Fire-and-track RPC issuer.
    pub(crate) rpcs: &'a mut RpcTracker,

    /// Process-wide count of in-flight write-class RPCs.
    pub(crate) write_rpcs_in_flight: &'a mut u32,

    /// Admission cap on write-class RPCs; saturated slots skip the round.
    pub(crate) max_write_rpcs_in_flight: u32,

    /// Transport payload cap for one write chunk.
    pub(crate) max_chunk: usize,

    /// Arena slot of the segment being performed.
    pub(crate) slot: usize,

    /// Arena slot generation of the segment being performed.
    pub(crate) slot_gen: u64,

    /// Whether the segment's predecessor in the log is durably closed (or
    /// gone), gating opens and closes of this segment.
    pub(crate) predecessor_closed: bool,
}

impl DriverCtx<'_> {
    fn admit_write_rpc(&mut self) -> bool {
        if *self.write_rpcs_in_flight >= self.max_write_rpcs_in_flight {
            return false;
        }
        *self.write_rpcs_in_flight += 1;
        true
    }
}

/// Per-segment replication state machine.
pub(crate) struct ReplicatedSegment {
    /// Log-assigned segment id.
    pub(crate) segment_id: u64,

    /// Committed byte image of the segment; grows monotonically.
    buf: BytesMut,

    /// Length of the prefix carried on open RPCs.
    open_len: usize,

    /// True once the log sealed the segment; never clears.
    close_queued: bool,

    /// True once the log freed the segment; the segment destroys itself
    /// after every replica reaches `Freed`.
    freed: bool,

    /// Replica slots, one per configured replica.
    pub(crate) replicas: Vec<Replica>,

    /// Arena slot of the segment opened just before this one, if still
    /// live; orders open-after-close across the log.
    pub(crate) prev: Option<usize>,

    /// Arena slot of the segment opened just after this one, if any.
    pub(crate) next: Option<usize>,
}

impl ReplicatedSegment {
    pub(crate) fn new(
        segment_id: u64,
        data: &[u8],
        open_len: usize,
        num_replicas: u32,
        prev: Option<usize>,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(data.len());
        buf.extend_from_slice(data);
        let replicas = (0..num_replicas)
            .map(|slot| Replica::new(slot == 0))
            .collect();
        ReplicatedSegment {
            segment_id,
            buf,
            open_len,
            close_queued: false,
            freed: false,
            replicas,
            prev,
            next: None,
        }
    }

    /// Committed length of the segment image.
    pub(crate) fn committed(&self) -> usize {
        self.buf.len()
    }

    /// Extends the committed image with bytes the log promises are stable.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Marks the segment sealed.
    pub(crate) fn queue_close(&mut self) {
        self.close_queued = true;
    }

    /// Marks the segment freed; replicas will be discarded from backups.
    pub(crate) fn queue_free(&mut self) {
        self.freed = true;
    }

    /// True once the log freed the segment.
    pub(crate) fn is_freed(&self) -> bool {
        self.freed
    }

    /// Number of replicas sealed on their backup (or beyond).
    fn closed_replicas(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| {
                matches!(
                    r.state,
                    ReplicaState::Closed
                        | ReplicaState::Freeing
                        | ReplicaState::Freed
                )
            })
            .count()
    }

    /// True once every replica slot has sealed on its backup; successors'
    /// opens are gated on this.
    pub(crate) fn closed_quorum(&self) -> bool {
        self.closed_replicas() >= self.replicas.len()
    }

    /// True if every replica has acknowledged at least `len` bytes, and,
    /// when the segment is sealed up to `len`, has also sealed durably.
    pub(crate) fn synced_to(&self, len: usize) -> bool {
        if self.replicas.iter().any(|r| r.cursor < len) {
            return false;
        }
        if self.close_queued && len >= self.committed() {
            return self.closed_quorum();
        }
        true
    }

    /// Invalidates every replica slot stored on the given backup, even ones
    /// whose RPCs previously succeeded. Returns true if any slot was hit.
    pub(crate) fn handle_backup_failure(&mut self, backup: ServerId) -> bool {
        let mut hit = false;
        for replica in &mut self.replicas {
            // unassigned slots hold the invalid id, which never equals a
            // live backup's
            if !replica.backup.same_as(backup) {
                continue;
            }
            match replica.state {
                ReplicaState::Freed => {}
                ReplicaState::Freeing => {
                    // the backup took the replica's storage down with it
                    replica.state = ReplicaState::Freed;
                    replica.rpc = None;
                    hit = true;
                }
                _ => {
                    replica.reset();
                    hit = true;
                }
            }
        }
        hit
    }

    /// Advances every replica slot as far as the current target and
    /// admission budget allow. Returns true once the segment is freed and
    /// every replica has reached `Freed`, at which point the caller
    /// destroys it.
    pub(crate) fn perform(&mut self, ctx: &mut DriverCtx) -> bool {
        for idx in 0..self.replicas.len() {
            self.perform_replica(idx, ctx);
        }
        self.freed
            && self
                .replicas
                .iter()
                .all(|r| r.state == ReplicaState::Freed)
    }

    fn perform_replica(&mut self, idx: usize, ctx: &mut DriverCtx) {
        let committed = self.committed();
        match self.replicas[idx].state {
            ReplicaState::Unassigned => {
                if self.freed {
                    // nothing durable exists for this slot to discard
                    self.replicas[idx].state = ReplicaState::Freed;
                    return;
                }
                if !ctx.predecessor_closed {
                    return;
                }
                if *ctx.write_rpcs_in_flight >= ctx.max_write_rpcs_in_flight
                {
                    return; // skip this round; retried once capacity frees
                }

                let exclude: Vec<ServerId> = self
                    .replicas
                    .iter()
                    .enumerate()
                    .filter(|(i, r)| *i != idx && r.backup.is_valid())
                    .map(|(_, r)| r.backup)
                    .collect();
                let is_primary = self.replicas[idx].is_primary;
                let choice = if is_primary {
                    ctx.selector.choose_primary(&exclude, committed)
                } else {
                    ctx.selector.choose_secondary(&exclude)
                };
                let Some(backup) = choice else {
                    return; // no eligible backup; yield until one enlists
                };

                *ctx.write_rpcs_in_flight += 1;
                let open_bytes =
                    Bytes::copy_from_slice(&self.buf[..self.open_len]);
                let rpc = ctx.rpcs.issue_open(
                    ctx.slot,
                    ctx.slot_gen,
                    idx,
                    backup,
                    self.segment_id,
                    open_bytes,
                    is_primary,
                );
                let replica = &mut self.replicas[idx];
                replica.backup = backup;
                replica.cursor = 0;
                replica.rpc = Some(rpc);
                replica.state = ReplicaState::Opening;
            }

            // an RPC is in flight for these; its completion drives the slot
            ReplicaState::Opening
            | ReplicaState::Writing
            | ReplicaState::Closing
            | ReplicaState::Freeing => {}

            ReplicaState::OpenAcked | ReplicaState::WriteAcked => {
                if self.freed {
                    self.issue_free(idx, ctx);
                    return;
                }
                let cursor = self.replicas[idx].cursor;
                if cursor < committed {
                    if !ctx.admit_write_rpc() {
                        return;
                    }
                    let chunk_len = (committed - cursor).min(ctx.max_chunk);
                    let chunk = Bytes::copy_from_slice(
                        &self.buf[cursor..cursor + chunk_len],
                    );
                    let rpc = ctx.rpcs.issue_write(
                        ctx.slot,
                        ctx.slot_gen,
                        idx,
                        self.replicas[idx].backup,
                        self.segment_id,
                        cursor as u64,
                        chunk,
                        false,
                    );
                    let replica = &mut self.replicas[idx];
                    replica.rpc = Some(rpc);
                    replica.state = ReplicaState::Writing;
                } else if self.close_queued && ctx.predecessor_closed {
                    if !ctx.admit_write_rpc() {
                        return;
                    }
                    // the seal travels as an empty write flagged close
                    let rpc = ctx.rpcs.issue_write(
                        ctx.slot,
                        ctx.slot_gen,
                        idx,
                        self.replicas[idx].backup,
                        self.segment_id,
                        cursor as u64,
                        Bytes::new(),
                        true,
                    );
                    let replica = &mut self.replicas[idx];
                    replica.rpc = Some(rpc);
                    replica.state = ReplicaState::Closing;
                }
            }

            ReplicaState::Closed => {
                if self.freed {
                    self.issue_free(idx, ctx);
                }
            }

            ReplicaState::Freed => {}
        }
    }

    fn issue_free(&mut self, idx: usize, ctx: &mut DriverCtx) {
        let backup = self.replicas[idx].backup;
        let rpc = ctx.rpcs.issue_free(
            ctx.slot,
            ctx.slot_gen,
            idx,
            backup,
            self.segment_id,
        );
        let replica = &mut self.replicas[idx];
        replica.rpc = Some(rpc);
        replica.state = ReplicaState::Freeing;
    }

    /// Applies the completion of an RPC to its replica slot. Returns true
    /// if this completion just brought the segment to closed-quorum, so the
    /// caller can drive the segment's successor.
    pub(crate) fn apply_rpc_result(
        &mut self,
        replica_idx: usize,
        rpc_id: RpcId,
        kind: BackupRpcKind,
        result: Result<BackupReply, RpcError>,
        backup_still_listed: bool,
    ) -> bool {
        let quorum_before = self.closed_quorum();

        let segment_id = self.segment_id;
        let replica = &mut self.replicas[replica_idx];
        if replica.rpc != Some(rpc_id) {
            // the slot regressed (or was recycled) while this RPC flew;
            // its result is discarded
            return false;
        }
        replica.rpc = None;

        match (kind, result) {
            (BackupRpcKind::Open { len }, Ok(BackupReply::Ok)) => {
                replica.cursor = len;
                replica.state = ReplicaState::OpenAcked;
            }
            (BackupRpcKind::Write { len, close }, Ok(BackupReply::Ok)) => {
                replica.cursor += len;
                replica.state = if close {
                    ReplicaState::Closed
                } else {
                    ReplicaState::WriteAcked
                };
            }
            (BackupRpcKind::Free, Ok(_)) => {
                // frees are idempotent; any reply means the frame is gone
                replica.state = ReplicaState::Freed;
            }
            (BackupRpcKind::Free, Err(e)) => {
                if backup_still_listed {
                    pf_warn!(
                        segment_id;
                        "free rpc to backup {} failed, retrying: {}",
                        replica.backup, e
                    );
                    replica.state = ReplicaState::Closed;
                } else {
                    // the backup left the cluster; its storage is reclaimed
                    // by the coordinator
                    replica.state = ReplicaState::Freed;
                }
            }
            (_, Ok(protocol_err)) => {
                pf_error!(
                    segment_id;
                    "backup {} rejected rpc with {:?}, restarting replica",
                    replica.backup, protocol_err
                );
                debug_assert!(
                    false,
                    "backup-side protocol error: {:?}",
                    protocol_err
                );
                replica.reset();
            }
            (_, Err(e)) => {
                pf_debug!(
                    segment_id;
                    "rpc to backup {} failed, restarting replica: {}",
                    replica.backup, e
                );
                replica.reset();
            }
        }

        !quorum_before && self.closed_quorum()
    }
}

#[cfg(test)]
mod segment_tests {
    use super::*;

    fn segment_with_states(states: &[ReplicaState]) -> ReplicatedSegment {
        let mut seg = ReplicatedSegment::new(
            42,
            b"ABCDEFGH",
            8,
            states.len() as u32,
            None,
        );
        for (idx, &state) in states.iter().enumerate() {
            seg.replicas[idx].state = state;
            seg.replicas[idx].backup = ServerId::new(idx as u32 + 1, 0);
            if !matches!(state, ReplicaState::Unassigned) {
                seg.replicas[idx].cursor = 8;
            }
        }
        seg
    }

    #[test]
    fn synced_to_needs_all_cursors() {
        let mut seg =
            segment_with_states(&[ReplicaState::WriteAcked; 3]);
        assert!(seg.synced_to(8));
        seg.replicas[1].cursor = 4;
        assert!(!seg.synced_to(8));
        assert!(seg.synced_to(4));
    }

    #[test]
    fn synced_to_full_length_waits_for_seal() {
        let mut seg =
            segment_with_states(&[ReplicaState::WriteAcked; 2]);
        seg.queue_close();
        assert!(!seg.synced_to(8));
        assert!(seg.synced_to(4)); // partial sync does not wait for seal
        seg.replicas[0].state = ReplicaState::Closed;
        assert!(!seg.synced_to(8));
        seg.replicas[1].state = ReplicaState::Closed;
        assert!(seg.synced_to(8));
    }

    #[test]
    fn zero_replicas_always_synced() {
        let seg = ReplicatedSegment::new(42, b"ABCDEFGH", 8, 0, None);
        assert!(seg.synced_to(8));
        assert!(seg.closed_quorum());
    }

    #[test]
    fn backup_failure_regresses_slots() {
        let mut seg = segment_with_states(&[
            ReplicaState::WriteAcked,
            ReplicaState::Closed,
            ReplicaState::Writing,
        ]);
        // same backup hosting two slots would violate placement, but the
        // failure handler must still sweep every slot
        seg.replicas[2].backup = ServerId::new(1, 0);
        seg.replicas[2].rpc = Some(77);

        assert!(seg.handle_backup_failure(ServerId::new(1, 0)));
        assert_eq!(seg.replicas[0].state, ReplicaState::Unassigned);
        assert_eq!(seg.replicas[0].cursor, 0);
        assert!(!seg.replicas[0].backup.is_valid());
        assert_eq!(seg.replicas[1].state, ReplicaState::Closed);
        assert_eq!(seg.replicas[2].state, ReplicaState::Unassigned);
        assert_eq!(seg.replicas[2].rpc, None);

        assert!(!seg.handle_backup_failure(ServerId::new(9, 0)));
    }

    #[test]
    fn failure_during_freeing_means_freed() {
        let mut seg = segment_with_states(&[ReplicaState::Freeing]);
        seg.queue_free();
        assert!(seg.handle_backup_failure(ServerId::new(1, 0)));
        assert_eq!(seg.replicas[0].state, ReplicaState::Freed);
    }

    #[test]
    fn stale_rpc_results_discarded() {
        let mut seg = segment_with_states(&[ReplicaState::Opening]);
        seg.replicas[0].rpc = Some(5);
        // completion for an rpc issued before the slot regressed
        seg.apply_rpc_result(
            0,
            4,
            BackupRpcKind::Open { len: 8 },
            Ok(BackupReply::Ok),
            true,
        );
        assert_eq!(seg.replicas[0].state, ReplicaState::Opening);

        seg.apply_rpc_result(
            0,
            5,
            BackupRpcKind::Open { len: 8 },
            Ok(BackupReply::Ok),
            true,
        );
        assert_eq!(seg.replicas[0].state, ReplicaState::OpenAcked);
        assert_eq!(seg.replicas[0].cursor, 8);
    }

    #[test]
    fn transport_failure_restarts_replica() {
        let mut seg = segment_with_states(&[ReplicaState::Writing]);
        seg.replicas[0].rpc = Some(3);
        seg.apply_rpc_result(
            0,
            3,
            BackupRpcKind::Write {
                len: 4,
                close: false,
            },
            Err(RpcError::Timeout),
            true,
        );
        assert_eq!(seg.replicas[0].state, ReplicaState::Unassigned);
        assert_eq!(seg.replicas[0].cursor, 0);
    }

    #[test]
    fn closing_ack_reports_quorum_once() {
        let mut seg = segment_with_states(&[
            ReplicaState::Closed,
            ReplicaState::Closing,
        ]);
        seg.queue_close();
        seg.replicas[1].rpc = Some(9);
        let reached = seg.apply_rpc_result(
            1,
            9,
            BackupRpcKind::Write {
                len: 0,
                close: true,
            },
            Ok(BackupReply::Ok),
            true,
        );
        assert!(reached);
        assert!(seg.closed_quorum());
    }

    #[test]
    fn free_failure_retries_while_listed() {
        let mut seg = segment_with_states(&[ReplicaState::Freeing]);
        seg.queue_free();
        seg.replicas[0].rpc = Some(1);
        seg.apply_rpc_result(
            0,
            1,
            BackupRpcKind::Free,
            Err(RpcError::Timeout),
            true,
        );
        assert_eq!(seg.replicas[0].state, ReplicaState::Closed);

        // once the backup is gone from the directory, give up on the frame
        seg.replicas[0].state = ReplicaState::Freeing;
        seg.replicas[0].rpc = Some(2);
        seg.apply_rpc_result(
            0,
            2,
            BackupRpcKind::Free,
            Err(RpcError::Timeout),
            false,
        );
        assert_eq!(seg.replicas[0].state, ReplicaState::Freed);
    }
}
