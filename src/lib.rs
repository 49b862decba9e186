//! Public interface to the MemRep core library, linked by the server
//! executable and by embedding storage masters.
//!
//! The library implements the replica manager of an in-memory log-structured
//! storage master: it durably replicates in-memory log segments onto remote
//! backup servers, transparently re-replicates after backup failures, and
//! keeps an eye on cluster-membership staleness through a failure detector.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod cluster;
pub mod rpc;

mod backup;
mod detector;
mod master;
mod segment;
mod selector;
mod task;

pub use backup::{BackupServer, BackupStore, PingServer};
pub use cluster::{
    ServerChangeEvent, ServerDetails, ServerEntry, ServerId, ServerList,
    ServerTracker, ServiceMask,
};
pub use detector::{DetectorConfig, FailureDetector};
pub use master::{MasterConfig, ReplicaManager, SegmentHandle};
pub use rpc::{
    BackupClient, BackupReply, BackupRequest, CoordReply, CoordRequest,
    CoordinatorClient, PingClient, PingReply, PingRequest, RpcError,
    TcpBackupClient, TcpCoordinatorClient, TcpPingClient,
};
pub use selector::{BackupSelector, BackupStats, Selector};
pub use utils::MemRepError;
