//! TCP implementations of the RPC client seams.
//!
//! Each call opens a fresh connection to the target, exchanges one framed
//! request/reply pair, and drops the connection. Backup and ping targets are
//! resolved through the local server list at call time; a locator missing
//! from the list surfaces as a transport error (the caller treats it as a
//! stale-identity race).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::time::{self, Duration};

use crate::cluster::{ServerId, ServerList, ServiceMask};
use crate::rpc::{
    BackupClient, BackupReply, BackupRequest, CoordReply, CoordRequest,
    CoordinatorClient, PingClient, PingReply, PingRequest, RpcError,
};
use crate::utils::{framed_recv, framed_send, tcp_connect_with_retry};

/// Resolves a server's locator through the local list into a socket address.
fn resolve(
    server_list: &ServerList,
    id: ServerId,
) -> Result<SocketAddr, RpcError> {
    let locator = server_list.locator(id)?;
    locator
        .parse()
        .map_err(|_| RpcError::Transport(format!("bad locator '{}'", locator)))
}

/// One connect/request/reply exchange against the given address.
async fn call_once<Req, Reply>(
    addr: SocketAddr,
    req: &Req,
) -> Result<Reply, RpcError>
where
    Req: serde::Serialize + Sync,
    Reply: serde::de::DeserializeOwned,
{
    let mut conn = tcp_connect_with_retry(addr, 0).await?;
    framed_send(&mut conn, req).await?;
    let mut read_buf = BytesMut::new();
    let reply = framed_recv(&mut read_buf, &mut conn).await?;
    Ok(reply)
}

/// Backup verb client over TCP.
pub struct TcpBackupClient {
    server_list: Arc<ServerList>,
}

impl TcpBackupClient {
    pub fn new(server_list: Arc<ServerList>) -> Self {
        TcpBackupClient { server_list }
    }
}

#[async_trait]
impl BackupClient for TcpBackupClient {
    async fn open(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        bytes: Bytes,
        is_primary: bool,
    ) -> Result<BackupReply, RpcError> {
        let addr = resolve(&self.server_list, backup)?;
        call_once(
            addr,
            &BackupRequest::Open {
                master,
                segment_id,
                bytes,
                is_primary,
            },
        )
        .await
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
        let addr = resolve(&self.server_list, backup)?;
        call_once(
            addr,
            &BackupRequest::Write {
                master,
                segment_id,
                offset,
                bytes,
                close,
            },
        )
        .await
    }

    async fn free(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
    ) -> Result<BackupReply, RpcError> {
        let addr = resolve(&self.server_list, backup)?;
        call_once(addr, &BackupRequest::Free { master, segment_id }).await
    }
}

/// Coordinator client over TCP; the coordinator's address is fixed at
/// construction since it is not itself a directory entry.
pub struct TcpCoordinatorClient {
    coord_addr: SocketAddr,
}

impl TcpCoordinatorClient {
    pub fn new(coord_addr: SocketAddr) -> Self {
        TcpCoordinatorClient { coord_addr }
    }
}

#[async_trait]
impl CoordinatorClient for TcpCoordinatorClient {
    async fn enlist(
        &self,
        services: ServiceMask,
        locator: String,
        read_speed_mb: u32,
        write_speed_mb: u32,
    ) -> Result<ServerId, RpcError> {
        let reply: CoordReply = call_once(
            self.coord_addr,
            &CoordRequest::Enlist {
                services,
                locator,
                read_speed_mb,
                write_speed_mb,
            },
        )
        .await?;
        match reply {
            CoordReply::Enlisted { id } => Ok(id),
            CoordReply::Ok => Err(RpcError::Protocol(
                "unexpected reply to enlist".into(),
            )),
        }
    }

    async fn hint_server_down(&self, id: ServerId) -> Result<(), RpcError> {
        let _: CoordReply =
            call_once(self.coord_addr, &CoordRequest::HintServerDown { id })
                .await?;
        Ok(())
    }

    async fn request_server_list(
        &self,
        id: ServerId,
    ) -> Result<(), RpcError> {
        let _: CoordReply = call_once(
            self.coord_addr,
            &CoordRequest::RequestServerList { id },
        )
        .await?;
        Ok(())
    }
}

/// Liveness probe client over TCP.
pub struct TcpPingClient {
    server_list: Arc<ServerList>,
}

impl TcpPingClient {
    pub fn new(server_list: Arc<ServerList>) -> Self {
        TcpPingClient { server_list }
    }
}

#[async_trait]
impl PingClient for TcpPingClient {
    async fn ping(
        &self,
        peer: ServerId,
        nonce: u64,
        timeout: Duration,
    ) -> Result<PingReply, RpcError> {
        let addr = resolve(&self.server_list, peer)?;
        let reply: PingReply = match time::timeout(
            timeout,
            call_once(addr, &PingRequest { nonce }),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => return Err(RpcError::Timeout),
        };
        if reply.nonce != nonce {
            return Err(RpcError::Protocol(format!(
                "ping nonce mismatch: sent {}, got {}",
                nonce, reply.nonce
            )));
        }
        Ok(reply)
    }
}
