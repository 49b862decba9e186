//! Backup-side segment replica storage and its TCP service loops.
//!
//! A backup keeps one frame per `(master, segment)` pair and enforces the
//! replication wire protocol on it: a replica must be opened before it is
//! written, writes land strictly in order at the frame's tail, and a closed
//! frame accepts no further writes. Frees are idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::cluster::{ServerId, ServerList};
use crate::rpc::{BackupReply, BackupRequest, PingReply, PingRequest};
use crate::utils::{
    framed_recv, framed_send, tcp_bind_with_retry, MemRepError,
};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One stored replica of a master's segment.
struct Frame {
    /// Replica bytes received so far.
    bytes: BytesMut,

    /// True while the replica accepts writes or has accepted them before
    /// being closed.
    open: bool,

    /// True once the master sealed the replica.
    closed: bool,

    /// Whether the master designated this replica primary for recovery.
    is_primary: bool,
}

/// In-memory store of segment replica frames held by one backup process.
pub struct BackupStore {
    frames: Mutex<HashMap<(u64, u64), Frame>>,
}

impl BackupStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        BackupStore {
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one request to the store, returning the protocol reply.
    pub fn handle(&self, req: &BackupRequest) -> BackupReply {
        match req {
            BackupRequest::Open {
                master,
                segment_id,
                bytes,
                is_primary,
            } => self.open(
                master.to_u64(),
                *segment_id,
                bytes.clone(),
                *is_primary,
            ),
            BackupRequest::Write {
                master,
                segment_id,
                offset,
                bytes,
                close,
            } => self.write(
                master.to_u64(),
                *segment_id,
                *offset,
                bytes.clone(),
                *close,
            ),
            BackupRequest::Free { master, segment_id } => {
                self.free(master.to_u64(), *segment_id)
            }
        }
    }

    fn open(
        &self,
        master: u64,
        segment_id: u64,
        bytes: Bytes,
        is_primary: bool,
    ) -> BackupReply {
        let mut frames = self.frames.lock().unwrap();
        if frames.contains_key(&(master, segment_id)) {
            return BackupReply::SegmentAlreadyOpen;
        }
        let mut frame_bytes = BytesMut::with_capacity(bytes.len());
        frame_bytes.extend_from_slice(&bytes);
        frames.insert(
            (master, segment_id),
            Frame {
                bytes: frame_bytes,
                open: true,
                closed: false,
                is_primary,
            },
        );
        BackupReply::Ok
    }

    fn write(
        &self,
        master: u64,
        segment_id: u64,
        offset: u64,
        bytes: Bytes,
        close: bool,
    ) -> BackupReply {
        let mut frames = self.frames.lock().unwrap();
        let frame = match frames.get_mut(&(master, segment_id)) {
            Some(frame) if frame.open => frame,
            _ => return BackupReply::SegmentNotOpen,
        };
        if frame.closed {
            return BackupReply::SegmentOutOfOrder;
        }
        if offset != frame.bytes.len() as u64 {
            return BackupReply::SegmentOutOfOrder;
        }
        frame.bytes.extend_from_slice(&bytes);
        if close {
            frame.closed = true;
        }
        BackupReply::Ok
    }

    fn free(&self, master: u64, segment_id: u64) -> BackupReply {
        let mut frames = self.frames.lock().unwrap();
        frames.remove(&(master, segment_id));
        BackupReply::Ok
    }

    /// Bytes of a stored replica, for recovery replay.
    pub fn segment_bytes(
        &self,
        master: ServerId,
        segment_id: u64,
    ) -> Option<Bytes> {
        let frames = self.frames.lock().unwrap();
        frames
            .get(&(master.to_u64(), segment_id))
            .map(|f| Bytes::copy_from_slice(&f.bytes))
    }

    /// Whether a stored replica has been sealed.
    pub fn segment_closed(
        &self,
        master: ServerId,
        segment_id: u64,
    ) -> Option<bool> {
        let frames = self.frames.lock().unwrap();
        frames
            .get(&(master.to_u64(), segment_id))
            .map(|f| f.closed)
    }

    /// Whether a stored replica is the designated primary.
    pub fn segment_primary(
        &self,
        master: ServerId,
        segment_id: u64,
    ) -> Option<bool> {
        let frames = self.frames.lock().unwrap();
        frames
            .get(&(master.to_u64(), segment_id))
            .map(|f| f.is_primary)
    }

    /// Number of replica frames currently stored.
    pub fn num_frames(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP accept loop serving `BackupRequest`s against a `BackupStore`.
pub struct BackupServer {
    /// Address the server ended up listening on.
    listen_addr: SocketAddr,

    /// Termination signal sender.
    tx_exit: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl BackupServer {
    /// Binds the listen address and spawns the acceptor task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        store: Arc<BackupStore>,
    ) -> Result<Self, MemRepError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let listen_addr = listener.local_addr()?;
        let (tx_exit, rx_exit) = watch::channel(false);

        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, store, rx_exit));

        Ok(BackupServer {
            listen_addr,
            tx_exit,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Address the server is reachable at.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Signals the acceptor task to exit.
    pub fn halt(&self) -> Result<(), MemRepError> {
        self.tx_exit.send(true)?;
        Ok(())
    }

    async fn acceptor_task(
        listener: TcpListener,
        store: Arc<BackupStore>,
        mut rx_exit: watch::Receiver<bool>,
    ) {
        pf_debug!("backup"; "acceptor task spawned");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer_addr)) => {
                            pf_debug!("backup"; "accepted conn from {}", peer_addr);
                            let store = store.clone();
                            tokio::spawn(async move {
                                let mut conn = conn;
                                let mut read_buf = BytesMut::new();
                                loop {
                                    let req: BackupRequest = match framed_recv(
                                        &mut read_buf,
                                        &mut conn,
                                    )
                                    .await
                                    {
                                        Ok(req) => req,
                                        Err(_) => break, // peer went away
                                    };
                                    let reply = store.handle(&req);
                                    if let Err(e) =
                                        framed_send(&mut conn, &reply).await
                                    {
                                        pf_warn!("backup"; "error sending reply: {}", e);
                                        break;
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            pf_error!("backup"; "error accepting conn: {}", e);
                        }
                    }
                },

                _ = rx_exit.changed() => {
                    break;
                },
            }
        }
        pf_debug!("backup"; "acceptor task exited");
    }
}

/// TCP accept loop answering liveness probes with the local server list
/// version.
pub struct PingServer {
    /// Address the server ended up listening on.
    listen_addr: SocketAddr,

    /// Termination signal sender.
    tx_exit: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl PingServer {
    /// Binds the listen address and spawns the acceptor task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        server_list: Arc<ServerList>,
    ) -> Result<Self, MemRepError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let listen_addr = listener.local_addr()?;
        let (tx_exit, rx_exit) = watch::channel(false);

        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, server_list, rx_exit));

        Ok(PingServer {
            listen_addr,
            tx_exit,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Address the server is reachable at.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Signals the acceptor task to exit.
    pub fn halt(&self) -> Result<(), MemRepError> {
        self.tx_exit.send(true)?;
        Ok(())
    }

    async fn acceptor_task(
        listener: TcpListener,
        server_list: Arc<ServerList>,
        mut rx_exit: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (mut conn, _) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_error!("ping"; "error accepting conn: {}", e);
                            continue;
                        }
                    };
                    let server_list = server_list.clone();
                    tokio::spawn(async move {
                        let mut read_buf = BytesMut::new();
                        while let Ok(req) = framed_recv::<PingRequest, _>(
                            &mut read_buf,
                            &mut conn,
                        )
                        .await
                        {
                            let reply = PingReply {
                                nonce: req.nonce,
                                list_version: server_list.version(),
                            };
                            if framed_send(&mut conn, &reply).await.is_err() {
                                break;
                            }
                        }
                    });
                },

                _ = rx_exit.changed() => {
                    break;
                },
            }
        }
    }
}
