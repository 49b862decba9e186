//! RPC wire messages and client seams toward backups, the coordinator, and
//! peers' ping endpoints.
//!
//! All messages travel as length-prefixed MessagePack frames (see
//! `utils::safetcp`). The client traits exist so the replica manager and the
//! failure detector never depend on a concrete transport; tests swap in
//! in-process doubles.

mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use crate::cluster::{ServerId, ServiceMask};

pub use tcp::{TcpBackupClient, TcpCoordinatorClient, TcpPingClient};

/// Request verbs a master issues against a backup. Every verb names the
/// issuing master and the segment it concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupRequest {
    /// Starts a replica of the segment, carrying its first open bytes.
    Open {
        master: ServerId,
        segment_id: u64,
        bytes: Bytes,
        is_primary: bool,
    },

    /// Appends bytes at the given offset; `close` seals the replica.
    Write {
        master: ServerId,
        segment_id: u64,
        offset: u64,
        bytes: Bytes,
        close: bool,
    },

    /// Discards the replica. Idempotent.
    Free { master: ServerId, segment_id: u64 },
}

/// Backup-side outcome of a `BackupRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupReply {
    Ok,
    SegmentAlreadyOpen,
    SegmentNotOpen,
    SegmentOutOfOrder,
}

/// Request verbs toward the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordRequest {
    /// Joins the cluster, advertising services and disk speeds.
    Enlist {
        services: ServiceMask,
        locator: String,
        read_speed_mb: u32,
        write_speed_mb: u32,
    },

    /// Best-effort report that a peer seems unresponsive.
    HintServerDown { id: ServerId },

    /// Asks for a fresh server list push to the given server.
    RequestServerList { id: ServerId },
}

/// Coordinator-side outcome of a `CoordRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordReply {
    Enlisted { id: ServerId },
    Ok,
}

/// Liveness probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub nonce: u64,
}

/// Liveness probe reply, echoing the nonce and reporting the responder's
/// server list version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    pub nonce: u64,
    pub list_version: u64,
}

/// RPC failure as seen by the caller. Deadline expiry is treated exactly
/// like a transport error; `Protocol` marks a reply that arrived intact but
/// made no sense for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    Timeout,
    Transport(String),
    Protocol(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "rpc timed out"),
            RpcError::Transport(m) => write!(f, "transport error: {}", m),
            RpcError::Protocol(m) => write!(f, "protocol error: {}", m),
        }
    }
}

impl From<crate::utils::MemRepError> for RpcError {
    fn from(e: crate::utils::MemRepError) -> Self {
        RpcError::Transport(e.0)
    }
}

/// Client seam for the three backup verbs.
#[async_trait]
pub trait BackupClient: Send + Sync {
    async fn open(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        bytes: Bytes,
        is_primary: bool,
    ) -> Result<BackupReply, RpcError>;

    async fn write(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        offset: u64,
        bytes: Bytes,
        close: bool,
    ) -> Result<BackupReply, RpcError>;

    async fn free(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
    ) -> Result<BackupReply, RpcError>;
}

/// Client seam for coordinator requests.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn enlist(
        &self,
        services: ServiceMask,
        locator: String,
        read_speed_mb: u32,
        write_speed_mb: u32,
    ) -> Result<ServerId, RpcError>;

    async fn hint_server_down(&self, id: ServerId) -> Result<(), RpcError>;

    async fn request_server_list(&self, id: ServerId)
        -> Result<(), RpcError>;
}

/// Client seam for liveness probes.
#[async_trait]
pub trait PingClient: Send + Sync {
    async fn ping(
        &self,
        peer: ServerId,
        nonce: u64,
        timeout: Duration,
    ) -> Result<PingReply, RpcError>;
}

/// Identifier of one in-flight backup RPC.
pub(crate) type RpcId = u64;

/// What kind of backup RPC an in-flight entry is, with enough bookkeeping to
/// apply its completion to the issuing replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackupRpcKind {
    Open { len: usize },
    Write { len: usize, close: bool },
    Free,
}

impl BackupRpcKind {
    /// Whether this RPC occupies a slot of the in-flight write admission
    /// cap. Frees are never admission-controlled.
    pub(crate) fn counts_against_cap(&self) -> bool {
        !matches!(self, BackupRpcKind::Free)
    }
}

/// Bookkeeping attached to one in-flight backup RPC.
#[derive(Debug, Clone)]
pub(crate) struct RpcCtx {
    /// Segment arena slot the RPC belongs to.
    pub(crate) slot: usize,

    /// Slot generation at issue time, to discard completions for recycled
    /// slots.
    pub(crate) slot_gen: u64,

    /// Replica index within the segment.
    pub(crate) replica: usize,

    /// Backup the RPC was sent to.
    pub(crate) backup: ServerId,

    /// Verb and bookkeeping.
    pub(crate) kind: BackupRpcKind,
}

/// Fire-and-track issuer of backup RPCs. Issuance spawns a task performing
/// the exchange under the transport deadline and never blocks; completion is
/// observed by draining the done channel on a later `proceed()`.
pub(crate) struct RpcTracker {
    /// Id of the master issuing RPCs.
    master: ServerId,

    /// Transport used for all backup verbs.
    client: Arc<dyn BackupClient>,

    /// Transport-level deadline applied to every call.
    timeout: Duration,

    /// Next RPC id to mint.
    next_id: RpcId,

    /// In-flight RPCs by id.
    outstanding: HashMap<RpcId, RpcCtx>,

    /// Sender side of the done channel, cloned into every spawned task.
    tx_done: mpsc::UnboundedSender<(RpcId, Result<BackupReply, RpcError>)>,
}

impl RpcTracker {
    pub(crate) fn new(
        master: ServerId,
        client: Arc<dyn BackupClient>,
        timeout: Duration,
        tx_done: mpsc::UnboundedSender<(RpcId, Result<BackupReply, RpcError>)>,
    ) -> Self {
        RpcTracker {
            master,
            client,
            timeout,
            next_id: 0,
            outstanding: HashMap::new(),
            tx_done,
        }
    }

    fn register(
        &mut self,
        slot: usize,
        slot_gen: u64,
        replica: usize,
        backup: ServerId,
        kind: BackupRpcKind,
    ) -> RpcId {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(
            id,
            RpcCtx {
                slot,
                slot_gen,
                replica,
                backup,
                kind,
            },
        );
        id
    }

    /// Issues an open RPC carrying the segment's first open bytes.
    pub(crate) fn issue_open(
        &mut self,
        slot: usize,
        slot_gen: u64,
        replica: usize,
        backup: ServerId,
        segment_id: u64,
        bytes: Bytes,
        is_primary: bool,
    ) -> RpcId {
        let id = self.register(
            slot,
            slot_gen,
            replica,
            backup,
            BackupRpcKind::Open { len: bytes.len() },
        );
        let (client, tx, master, timeout) = self.spawn_parts();
        tokio::spawn(async move {
            let result = match time::timeout(
                timeout,
                client.open(backup, master, segment_id, bytes, is_primary),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(RpcError::Timeout),
            };
            let _ = tx.send((id, result));
        });
        id
    }

    /// Issues a write RPC for the chunk at the given offset; `close` seals
    /// the replica once the chunk is applied.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn issue_write(
        &mut self,
        slot: usize,
        slot_gen: u64,
        replica: usize,
        backup: ServerId,
        segment_id: u64,
        offset: u64,
        bytes: Bytes,
        close: bool,
    ) -> RpcId {
        let id = self.register(
            slot,
            slot_gen,
            replica,
            backup,
            BackupRpcKind::Write {
                len: bytes.len(),
                close,
            },
        );
        let (client, tx, master, timeout) = self.spawn_parts();
        tokio::spawn(async move {
            let result = match time::timeout(
                timeout,
                client.write(backup, master, segment_id, offset, bytes, close),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(RpcError::Timeout),
            };
            let _ = tx.send((id, result));
        });
        id
    }

    /// Issues a free RPC; not admission-controlled.
    pub(crate) fn issue_free(
        &mut self,
        slot: usize,
        slot_gen: u64,
        replica: usize,
        backup: ServerId,
        segment_id: u64,
    ) -> RpcId {
        let id = self.register(
            slot,
            slot_gen,
            replica,
            backup,
            BackupRpcKind::Free,
        );
        let (client, tx, master, timeout) = self.spawn_parts();
        tokio::spawn(async move {
            let result = match time::timeout(
                timeout,
                client.free(backup, master, segment_id),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(RpcError::Timeout),
            };
            let _ = tx.send((id, result));
        });
        id
    }

    /// Takes the bookkeeping of a completed RPC out of the in-flight table.
    pub(crate) fn complete(&mut self, id: RpcId) -> Option<RpcCtx> {
        self.outstanding.remove(&id)
    }

    /// Number of RPCs currently in flight.
    pub(crate) fn num_outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn spawn_parts(
        &self,
    ) -> (
        Arc<dyn BackupClient>,
        mpsc::UnboundedSender<(RpcId, Result<BackupReply, RpcError>)>,
        ServerId,
        Duration,
    ) {
        (
            self.client.clone(),
            self.tx_done.clone(),
            self.master,
            self.timeout,
        )
    }
}
