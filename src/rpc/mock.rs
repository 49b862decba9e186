//! In-process test doubles for the RPC client seams, with fault injection
//! and call recording.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{self, Duration};

use crate::backup::BackupStore;
use crate::cluster::{ServerId, ServiceMask};
use crate::rpc::{
    BackupClient, BackupReply, BackupRequest, CoordinatorClient, PingClient,
    PingReply, RpcError,
};

/// One recorded backup RPC, for assertions on wire traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RpcRecord {
    Open {
        backup: ServerId,
        segment_id: u64,
        len: usize,
        is_primary: bool,
    },
    Write {
        backup: ServerId,
        segment_id: u64,
        offset: u64,
        len: usize,
        close: bool,
    },
    Free {
        backup: ServerId,
        segment_id: u64,
    },
}

struct MockBackupsInner {
    stores: HashMap<ServerId, BackupStore>,
    down: HashSet<ServerId>,
    records: Vec<RpcRecord>,
    latency: Option<Duration>,
}

/// A fleet of in-process backups reachable through the `BackupClient` seam.
/// Backups can be marked down to inject transport errors.
pub(crate) struct MockBackups {
    inner: Mutex<MockBackupsInner>,
}

impl MockBackups {
    pub(crate) fn new() -> Self {
        MockBackups {
            inner: Mutex::new(MockBackupsInner {
                stores: HashMap::new(),
                down: HashSet::new(),
                records: vec![],
                latency: None,
            }),
        }
    }

    /// Brings a backup process up (with an empty store).
    pub(crate) fn add_backup(&self, id: ServerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.stores.entry(id).or_insert_with(BackupStore::new);
        inner.down.remove(&id);
    }

    /// Kills a backup process: all verbs to it fail and its in-memory
    /// frames are lost.
    pub(crate) fn remove_backup(&self, id: ServerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.stores.remove(&id);
        inner.down.insert(id);
    }

    /// Adds a fixed delay to every verb, so in-flight RPCs stay observable.
    pub(crate) fn set_latency(&self, latency: Duration) {
        self.inner.lock().unwrap().latency = Some(latency);
    }

    fn latency(&self) -> Option<Duration> {
        self.inner.lock().unwrap().latency
    }

    /// Marks a backup unreachable; all verbs to it fail with a transport
    /// error until it is brought back up.
    pub(crate) fn set_down(&self, id: ServerId, down: bool) {
        let mut inner = self.inner.lock().unwrap();
        if down {
            inner.down.insert(id);
        } else {
            inner.down.remove(&id);
        }
    }

    /// Snapshot of recorded RPCs so far.
    pub(crate) fn records(&self) -> Vec<RpcRecord> {
        self.inner.lock().unwrap().records.clone()
    }

    /// Stored replica bytes on a backup, for recovery replay.
    pub(crate) fn segment_bytes(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
    ) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        inner
            .stores
            .get(&backup)
            .and_then(|s| s.segment_bytes(master, segment_id))
    }

    /// Whether a stored replica on a backup has been sealed.
    pub(crate) fn segment_closed(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
    ) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        inner
            .stores
            .get(&backup)
            .and_then(|s| s.segment_closed(master, segment_id))
    }

    /// Total replica frames stored across all backups.
    pub(crate) fn total_frames(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.stores.values().map(|s| s.num_frames()).sum()
    }

    fn dispatch(
        &self,
        backup: ServerId,
        record: RpcRecord,
        req: BackupRequest,
    ) -> Result<BackupReply, RpcError> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.push(record);
        if inner.down.contains(&backup) {
            return Err(RpcError::Transport(format!(
                "backup {} unreachable",
                backup
            )));
        }
        match inner.stores.get(&backup) {
            Some(store) => Ok(store.handle(&req)),
            None => Err(RpcError::Transport(format!(
                "backup {} unknown",
                backup
            ))),
        }
    }
}

#[async_trait]
impl BackupClient for MockBackups {
    async fn open(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        bytes: Bytes,
        is_primary: bool,
    ) -> Result<BackupReply, RpcError> {
        if let Some(latency) = self.latency() {
            time::sleep(latency).await;
        }
        self.dispatch(
            backup,
            RpcRecord::Open {
                backup,
                segment_id,
                len: bytes.len(),
                is_primary,
            },
            BackupRequest::Open {
                master,
                segment_id,
                bytes,
                is_primary,
            },
        )
    }

    async fn write(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        offset: u64,
        bytes: Bytes,
        close: bool,
    ) -> Result<BackupReply, RpcError> {
        if let Some(latency) = self.latency() {
            time::sleep(latency).await;
        }
        self.dispatch(
            backup,
            RpcRecord::Write {
                backup,
                segment_id,
                offset,
                len: bytes.len(),
                close,
            },
            BackupRequest::Write {
                master,
                segment_id,
                offset,
                bytes,
                close,
            },
        )
    }

    async fn free(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
    ) -> Result<BackupReply, RpcError> {
        if let Some(latency) = self.latency() {
            time::sleep(latency).await;
        }
        self.dispatch(
            backup,
            RpcRecord::Free { backup, segment_id },
            BackupRequest::Free { master, segment_id },
        )
    }
}

/// Coordinator double that hands out dense ids and records best-effort
/// calls.
pub(crate) struct MockCoordinator {
    inner: Mutex<MockCoordinatorInner>,
}

struct MockCoordinatorInner {
    next_index: u32,
    hints: Vec<ServerId>,
    list_requests: Vec<ServerId>,
    unreachable: bool,
}

impl MockCoordinator {
    pub(crate) fn new() -> Self {
        MockCoordinator {
            inner: Mutex::new(MockCoordinatorInner {
                next_index: 1, // index 0 is reserved
                hints: vec![],
                list_requests: vec![],
                unreachable: false,
            }),
        }
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    pub(crate) fn hints(&self) -> Vec<ServerId> {
        self.inner.lock().unwrap().hints.clone()
    }

    pub(crate) fn list_requests(&self) -> Vec<ServerId> {
        self.inner.lock().unwrap().list_requests.clone()
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinator {
    async fn enlist(
        &self,
        _services: ServiceMask,
        _locator: String,
        _read_speed_mb: u32,
        _write_speed_mb: u32,
    ) -> Result<ServerId, RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(RpcError::Transport("coordinator unreachable".into()));
        }
        let id = ServerId::new(inner.next_index, 0);
        inner.next_index += 1;
        Ok(id)
    }

    async fn hint_server_down(&self, id: ServerId) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(RpcError::Transport("coordinator unreachable".into()));
        }
        inner.hints.push(id);
        Ok(())
    }

    async fn request_server_list(
        &self,
        id: ServerId,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(RpcError::Transport("coordinator unreachable".into()));
        }
        inner.list_requests.push(id);
        Ok(())
    }
}

/// Scripted ping responder: each peer either reports a server list version
/// or fails with a transport error.
pub(crate) struct MockPing {
    peers: Mutex<HashMap<ServerId, Result<u64, RpcError>>>,
}

impl MockPing {
    pub(crate) fn new() -> Self {
        MockPing {
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_version(&self, peer: ServerId, version: u64) {
        self.peers.lock().unwrap().insert(peer, Ok(version));
    }

    pub(crate) fn set_unresponsive(&self, peer: ServerId) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer, Err(RpcError::Timeout));
    }
}

#[async_trait]
impl PingClient for MockPing {
    async fn ping(
        &self,
        peer: ServerId,
        nonce: u64,
        _timeout: Duration,
    ) -> Result<PingReply, RpcError> {
        let peers = self.peers.lock().unwrap();
        match peers.get(&peer) {
            Some(Ok(version)) => Ok(PingReply {
                nonce,
                list_version: *version,
            }),
            Some(Err(e)) => Err(e.clone()),
            None => Err(RpcError::Transport(format!(
                "peer {} unknown to mock",
                peer
            ))),
        }
    }
}
