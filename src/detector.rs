//! Failure detector module implementation.
//!
//! Runs an independent probe loop per server process: every probe interval
//! it pings one uniformly random peer offering the ping service. A probe
//! timeout produces a best-effort `hint_server_down` to the coordinator. A
//! successful probe reports the peer's server list version; if ours lags
//! behind it for longer than the stale timeout, we ask the coordinator for
//! a fresh list push. The detector talks to the rest of the process only
//! through its own server tracker and the coordinator client; it never
//! shares the replica manager's mutex.

use std::sync::{Arc, Mutex};

use rand::prelude::*;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::cluster::{ServerId, ServerList, ServerTracker, ServiceMask};
use crate::rpc::{CoordinatorClient, PingClient};
use crate::utils::MemRepError;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DetectorConfig {
    /// Microseconds between probe rounds.
    pub probe_interval_us: u64,

    /// Transport-level deadline for one probe, in microseconds.
    pub probe_timeout_us: u64,

    /// Microseconds a lagging server list version is tolerated before a
    /// fresh push is requested from the coordinator.
    pub stale_server_list_us: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            probe_interval_us: 50_000,
            probe_timeout_us: 20_000,
            stale_server_list_us: 500_000,
        }
    }
}

/// Lag suspicion raised when a peer reports a newer server list version.
struct StaleSuspicion {
    /// Our version when the suspicion was raised; advancing past it clears
    /// the suspicion.
    version: u64,

    /// When the suspicion was raised.
    since: Instant,
}

/// State carried by the probe loop task.
struct ProbeLoop {
    me: ServerId,
    server_list: Arc<ServerList>,
    tracker: Arc<Mutex<ServerTracker<()>>>,
    coord: Arc<dyn CoordinatorClient>,
    ping: Arc<dyn PingClient>,
    config: DetectorConfig,
    suspicion: Option<StaleSuspicion>,
}

impl ProbeLoop {
    async fn run(mut self, mut rx_exit: watch::Receiver<bool>) {
        pf_debug!(self.me; "failure detector task spawned");
        let mut interval = time::interval(Duration::from_micros(
            self.config.probe_interval_us,
        ));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_tracker();
                    self.check_stale().await;
                    self.ping_random_peer().await;
                },

                _ = rx_exit.changed() => break,
            }
        }
        pf_debug!(self.me; "failure detector task exited");
    }

    /// Folds pending membership changes into the detector's view.
    fn drain_tracker(&self) {
        let mut tracker = self.tracker.lock().unwrap();
        while tracker.get_change().is_some() {}
    }

    /// Probes one uniformly random ping-capable peer, excluding ourself.
    async fn ping_random_peer(&mut self) {
        let pingee = {
            let tracker = self.tracker.lock().unwrap();
            tracker.random_with_service(ServiceMask::PING)
        };
        if !pingee.is_valid() || pingee == self.me {
            // nobody else to talk to this round
            return;
        }

        // the peer may have been removed between selection and use; that is
        // just a race with the membership feed, skip the round
        let locator = match self.server_list.locator(pingee) {
            Ok(locator) => locator,
            Err(_) => {
                pf_info!(self.me; "peer {} went stale before ping", pingee);
                return;
            }
        };

        let nonce = thread_rng().gen::<u64>();
        let timeout = Duration::from_micros(self.config.probe_timeout_us);
        match self.ping.ping(pingee, nonce, timeout).await {
            Ok(reply) => {
                pf_trace!(self.me; "ping succeeded to server {}", pingee);
                self.observe_version(reply.list_version);
            }
            Err(e) => {
                pf_warn!(
                    self.me;
                    "ping timeout to server {} ('{}'): {}",
                    pingee, locator, e
                );
                self.alert_coordinator(pingee).await;
            }
        }
    }

    /// Tells the coordinator we failed to get a timely ping response,
    /// swallowing transport errors on the hint itself.
    async fn alert_coordinator(&self, peer: ServerId) {
        if let Err(e) = self.coord.hint_server_down(peer).await {
            pf_warn!(
                self.me;
                "hint server down failed, maybe the network is disconnected: {}",
                e
            );
        }
    }

    /// Compares a version observed on a peer with our own. If the peer is
    /// ahead and we were not already suspicious, records the current
    /// version and time; `check_stale` handles the rest after hysteresis.
    fn observe_version(&mut self, observed: u64) {
        if self.suspicion.is_some() {
            return;
        }
        let current = self.server_list.version();
        if observed <= current {
            return;
        }
        self.suspicion = Some(StaleSuspicion {
            version: current,
            since: Instant::now(),
        });
    }

    /// Polls an active suspicion: cleared if our version advanced past the
    /// recorded one, otherwise a fresh list push is requested once the
    /// stale timeout passes. The suspicion is dropped regardless of the
    /// coordinator's response.
    async fn check_stale(&mut self) {
        let (version, since) = match &self.suspicion {
            Some(suspicion) => (suspicion.version, suspicion.since),
            None => return,
        };
        let current = self.server_list.version();
        if current > version {
            self.suspicion = None;
            return;
        }
        if since.elapsed()
            < Duration::from_micros(self.config.stale_server_list_us)
        {
            return;
        }

        pf_warn!(
            self.me;
            "stale server list detected (version {}), requesting new push",
            current
        );
        if let Err(e) = self.coord.request_server_list(self.me).await {
            pf_warn!(self.me; "request to coordinator failed: {}", e);
        }
        self.suspicion = None;
    }
}

/// Periodic prober hinting suspected-down peers to the coordinator and
/// detecting stale local directory views.
pub struct FailureDetector {
    me: ServerId,

    /// Termination signal sender.
    tx_exit: watch::Sender<bool>,

    /// Join handle of the probe loop task.
    loop_handle: Option<JoinHandle<()>>,
}

impl FailureDetector {
    /// Creates a new failure detector and starts its probe loop task,
    /// registering the detector's own tracker with the local server list.
    pub fn new_and_setup(
        me: ServerId,
        server_list: Arc<ServerList>,
        coord: Arc<dyn CoordinatorClient>,
        ping: Arc<dyn PingClient>,
        config: DetectorConfig,
    ) -> Result<Self, MemRepError> {
        if config.probe_interval_us == 0 {
            return logged_err!(me; "invalid config.probe_interval_us '0'");
        }
        if config.probe_timeout_us == 0 {
            return logged_err!(me; "invalid config.probe_timeout_us '0'");
        }
        if config.stale_server_list_us == 0 {
            return logged_err!(me; "invalid config.stale_server_list_us '0'");
        }

        let tracker = Arc::new(Mutex::new(ServerTracker::new()));
        server_list.register(tracker.clone());

        let (tx_exit, rx_exit) = watch::channel(false);
        let probe_loop = ProbeLoop {
            me,
            server_list,
            tracker,
            coord,
            ping,
            config,
            suspicion: None,
        };
        let loop_handle = tokio::spawn(probe_loop.run(rx_exit));

        Ok(FailureDetector {
            me,
            tx_exit,
            loop_handle: Some(loop_handle),
        })
    }

    /// Stops the probe loop task and waits for it to wind down.
    pub async fn halt(&mut self) -> Result<(), MemRepError> {
        self.tx_exit.send(true)?;
        if let Some(handle) = self.loop_handle.take() {
            handle.await?;
        }
        pf_info!(self.me; "failure detector halted");
        Ok(())
    }
}
