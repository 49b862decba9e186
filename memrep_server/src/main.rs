//! MemRep server node executable.
//!
//! Runs either as a backup daemon (serving segment replica storage over
//! TCP) or as a demo storage master that replicates a batch of in-memory
//! segments onto a static roster of backups and reports throughput.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use memrep::{
    parsed_config, pf_error, pf_info, BackupServer, BackupStore,
    DetectorConfig, FailureDetector, MasterConfig, MemRepError,
    ReplicaManager, ServerDetails, ServerId, ServerList, ServiceMask,
    TcpBackupClient, TcpCoordinatorClient, TcpPingClient,
};

/// Node roles selectable from the command line.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Role {
    Backup,
    Master,
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Role of this node: 'backup' or 'master'.
    #[arg(short, long, default_value_t = String::from("backup"))]
    role: String,

    /// Address the backup service listens on (backup role).
    #[arg(short, long, default_value = "127.0.0.1:52800")]
    listen: SocketAddr,

    /// Backup node addresses forming the replication roster (master role).
    /// Example: '-b host1:port1 -b host2:port2 -b host3:port3'.
    #[arg(short, long)]
    backups: Vec<SocketAddr>,

    /// Coordinator address; starts the failure detector when given
    /// (master role).
    #[arg(short, long)]
    coordinator: Option<SocketAddr>,

    /// Replica manager configuration TOML string, e.g.
    /// 'num_replicas = 2'.
    #[arg(long)]
    config: Option<String>,

    /// Number of demo segments to replicate (master role).
    #[arg(long, default_value_t = 4)]
    segments: u64,

    /// Bytes per demo segment (master role).
    #[arg(long, default_value_t = 1 << 20)]
    segment_bytes: usize,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning `Ok(role)` on success or
    /// `Err(MemRepError)` on any error.
    fn sanitize(&self) -> Result<Role, MemRepError> {
        let role = match self.role.as_str() {
            "backup" => Role::Backup,
            "master" => Role::Master,
            _ => {
                return Err(MemRepError(format!(
                    "role '{}' unrecognized",
                    self.role
                )));
            }
        };

        if role == Role::Master {
            if self.backups.is_empty() {
                return Err(MemRepError(
                    "master role requires at least one backup".into(),
                ));
            }
            let mut backups_set = HashSet::new();
            for addr in self.backups.iter() {
                if !backups_set.insert(addr) {
                    return Err(MemRepError(format!(
                        "duplicate backup address '{}' given",
                        addr
                    )));
                }
            }
            if self.segments == 0 {
                return Err(MemRepError(format!(
                    "invalid number of segments {}",
                    self.segments
                )));
            }
            if self.segment_bytes == 0 {
                return Err(MemRepError(format!(
                    "invalid segment_bytes {}",
                    self.segment_bytes
                )));
            }
        }

        if self.threads < 2 {
            Err(MemRepError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(role)
        }
    }
}

/// Runs the backup daemon until interrupted.
async fn backup_main(args: &CliArgs) -> Result<(), MemRepError> {
    let store = Arc::new(BackupStore::new());
    let server = BackupServer::new_and_setup(args.listen, store).await?;
    pf_info!("backup"; "backup service listening on {}", server.listen_addr());

    tokio::signal::ctrl_c().await?;
    server.halt()?;
    Ok(())
}

/// Runs the demo storage master against the given backup roster.
async fn master_main(args: &CliArgs) -> Result<(), MemRepError> {
    // build the local server list from the static roster
    let server_list = Arc::new(ServerList::new());
    for (idx, addr) in args.backups.iter().enumerate() {
        server_list.add(ServerDetails::new(
            ServerId::new(idx as u32 + 1, 0),
            ServiceMask::BACKUP,
            addr.to_string(),
            100, // advertised read speed in MB/s
        ))?;
    }
    let me = ServerId::new(args.backups.len() as u32 + 1, 0);

    let config = parsed_config!(args.config.as_deref() => MasterConfig;
                                num_replicas, max_write_rpcs_in_flight,
                                power_of_k_choices, max_write_chunk_bytes,
                                rpc_timeout_ms)?;
    pf_info!(me; "starting master with {:?}", config);

    let mgr = ReplicaManager::new_and_setup(
        me,
        config,
        &server_list,
        Arc::new(TcpBackupClient::new(server_list.clone())),
    )?;

    let mut detector = match args.coordinator {
        Some(coord_addr) => Some(FailureDetector::new_and_setup(
            me,
            server_list.clone(),
            Arc::new(TcpCoordinatorClient::new(coord_addr)),
            Arc::new(TcpPingClient::new(server_list.clone())),
            DetectorConfig::default(),
        )?),
        None => None,
    };

    // replicate a batch of segments and report throughput
    let data = vec![0xabu8; args.segment_bytes];
    let open_len = data.len().min(4096);
    let start = Instant::now();
    for segment_id in 0..args.segments {
        let seg = mgr.open_segment(segment_id, &data, open_len)?;
        seg.sync(data.len()).await?;
        seg.close()?;
        seg.sync(data.len()).await?;
    }
    let elapsed = start.elapsed();
    let total_mb = (args.segments as f64 * args.segment_bytes as f64)
        / (1024.0 * 1024.0);
    pf_info!(
        me;
        "replicated {} segments ({:.1} MB) in {:.3} s: {:.1} MB/s per replica",
        args.segments,
        total_mb,
        elapsed.as_secs_f64(),
        total_mb / elapsed.as_secs_f64()
    );

    if let Some(detector) = detector.as_mut() {
        detector.halt().await?;
    }
    mgr.shutdown();
    Ok(())
}

// Server node executable main entrance.
fn server_main() -> Result<(), MemRepError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let role = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-{}", args.role))
        .build()?;

    // enter tokio runtime and run the selected role until completion
    runtime.block_on(async move {
        match role {
            Role::Backup => backup_main(&args).await?,
            Role::Master => master_main(&args).await?,
        }
        Ok::<(), MemRepError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
    }
}
