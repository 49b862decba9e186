//! Versioned cluster directory module implementation.
//!
//! Every server process holds an eventually-consistent copy of the cluster's
//! server list; the authoritative copy lives on the coordinator. Each
//! authoritative change advances the list's version number and fans an event
//! out to every registered subscriber tracker.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cluster::{
    ServerChangeEvent, ServerDetails, ServerId, ServiceMask, TrackerSink,
};
use crate::utils::MemRepError;

/// Wire form of one server list entry, as pushed by the coordinator.
/// `segment_id` and `user_data` are payload for higher layers and opaque to
/// the directory core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub service_mask: u32,
    pub server_id: u64,
    pub segment_id: u64,
    pub locator: String,
    pub user_data: u64,
    pub is_in_cluster: bool,
}

impl ServerEntry {
    /// Projects the wire entry down to the details subscribers track.
    pub fn to_details(&self) -> ServerDetails {
        ServerDetails {
            server_id: ServerId::from_u64(self.server_id),
            services: ServiceMask::from_u32(self.service_mask),
            locator: self.locator.clone(),
            user_data: self.user_data,
        }
    }
}

/// Directory state under the list's own lock.
struct ServerListInner {
    /// Entries stored densely by server id index.
    entries: Vec<Option<ServerDetails>>,

    /// Version number advanced on every authoritative change.
    version: u64,

    /// Registered subscriber trackers.
    sinks: Vec<Arc<dyn TrackerSink>>,
}

impl ServerListInner {
    fn fan_out(&self, details: ServerDetails, event: ServerChangeEvent) {
        for sink in &self.sinks {
            sink.enqueue_change(details.clone(), event);
        }
    }

    fn do_remove(&mut self, id: ServerId) -> Result<(), MemRepError> {
        let index = id.index() as usize;
        let occupied = matches!(
            self.entries.get(index).and_then(|s| s.as_ref()),
            Some(d) if d.server_id == id
        );
        if !occupied {
            return Err(MemRepError(format!("server {} not in list", id)));
        }
        let details = self.entries[index].take().unwrap();
        self.fan_out(details, ServerChangeEvent::Removed);
        Ok(())
    }
}

/// The cluster-wide roster of live server processes, local copy.
pub struct ServerList {
    inner: Mutex<ServerListInner>,
}

impl ServerList {
    /// Creates a new, empty server list at version 0.
    pub fn new() -> Self {
        ServerList {
            inner: Mutex::new(ServerListInner {
                entries: vec![],
                version: 0,
                sinks: vec![],
            }),
        }
    }

    /// Registers a subscriber tracker. All currently-present entries are
    /// replayed into the tracker as `Added` events so a late subscriber
    /// starts from a complete view.
    pub fn register(&self, sink: Arc<dyn TrackerSink>) {
        let mut inner = self.inner.lock().unwrap();
        for details in inner.entries.iter().flatten() {
            sink.enqueue_change(details.clone(), ServerChangeEvent::Added);
        }
        inner.sinks.push(sink);
    }

    /// Current directory version.
    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    /// Adds a server to the list, advancing the version. If the entry's
    /// index is occupied by an older incarnation, that incarnation is
    /// removed first (its crash recovery is in flight elsewhere).
    pub fn add(&self, details: ServerDetails) -> Result<(), MemRepError> {
        if !details.server_id.is_valid() {
            return logged_err!("list"; "refusing to add invalid server id");
        }
        let mut inner = self.inner.lock().unwrap();
        let index = details.server_id.index() as usize;
        if index >= inner.entries.len() {
            inner.entries.resize(index + 1, None);
        }
        if let Some(old) = inner.entries[index].clone() {
            if old.server_id == details.server_id {
                return logged_err!(
                    "list";
                    "server {} already in list",
                    details.server_id
                );
            }
            inner.do_remove(old.server_id)?;
        }
        inner.entries[index] = Some(details.clone());
        inner.version += 1;
        inner.fan_out(details, ServerChangeEvent::Added);
        Ok(())
    }

    /// Removes a server from the list, advancing the version. The id must
    /// match the stored entry's generation.
    pub fn remove(&self, id: ServerId) -> Result<(), MemRepError> {
        let mut inner = self.inner.lock().unwrap();
        inner.do_remove(id)?;
        inner.version += 1;
        Ok(())
    }

    /// Replaces the whole list with a full snapshot pushed by the
    /// coordinator, emitting the differences as events. Entries flagged not
    /// in cluster are treated as absent.
    pub fn apply_full_list(
        &self,
        entries: &[ServerEntry],
        version: u64,
    ) -> Result<(), MemRepError> {
        let mut inner = self.inner.lock().unwrap();
        if version < inner.version {
            return logged_err!(
                "list";
                "refusing stale full list: version {} < {}",
                version,
                inner.version
            );
        }

        let fresh: Vec<ServerDetails> = entries
            .iter()
            .filter(|e| e.is_in_cluster)
            .map(|e| e.to_details())
            .collect();

        // remove stale incarnations first
        let stale: Vec<ServerId> = inner
            .entries
            .iter()
            .flatten()
            .map(|d| d.server_id)
            .filter(|&id| !fresh.iter().any(|d| d.server_id == id))
            .collect();
        for id in stale {
            inner.do_remove(id)?;
        }

        // then fill in newcomers
        for details in fresh {
            let index = details.server_id.index() as usize;
            if index >= inner.entries.len() {
                inner.entries.resize(index + 1, None);
            }
            if inner.entries[index].is_none() {
                inner.entries[index] = Some(details.clone());
                inner.fan_out(details, ServerChangeEvent::Added);
            }
        }

        inner.version = version;
        Ok(())
    }

    /// Network locator of the given server.
    pub fn locator(&self, id: ServerId) -> Result<String, MemRepError> {
        let inner = self.inner.lock().unwrap();
        let index = id.index() as usize;
        match inner.entries.get(index).and_then(|s| s.as_ref()) {
            Some(details) if details.server_id == id => {
                Ok(details.locator.clone())
            }
            _ => Err(MemRepError(format!("server {} not in list", id))),
        }
    }
}

impl Default for ServerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod list_tests {
    use super::*;
    use crate::cluster::ServerTracker;

    fn details(index: u32, generation: u32) -> ServerDetails {
        ServerDetails::new(
            ServerId::new(index, generation),
            ServiceMask::BACKUP.with(ServiceMask::PING),
            format!("tcp:host=backup{}", index),
            100,
        )
    }

    #[test]
    fn version_advances() -> Result<(), MemRepError> {
        let list = ServerList::new();
        assert_eq!(list.version(), 0);
        list.add(details(1, 0))?;
        assert_eq!(list.version(), 1);
        list.remove(ServerId::new(1, 0))?;
        assert_eq!(list.version(), 2);
        assert!(list.remove(ServerId::new(1, 0)).is_err());
        Ok(())
    }

    #[test]
    fn fan_out_to_trackers() -> Result<(), MemRepError> {
        let list = ServerList::new();
        list.add(details(1, 0))?;

        // registration replays current entries
        let tracker = Arc::new(Mutex::new(ServerTracker::<u32>::new()));
        list.register(tracker.clone());
        list.add(details(2, 0))?;
        list.remove(ServerId::new(1, 0))?;

        let mut tr = tracker.lock().unwrap();
        let events: Vec<_> = std::iter::from_fn(|| tr.get_change()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0.server_id, ServerId::new(1, 0));
        assert_eq!(events[0].1, ServerChangeEvent::Added);
        assert_eq!(events[1].0.server_id, ServerId::new(2, 0));
        assert_eq!(events[1].1, ServerChangeEvent::Added);
        assert_eq!(events[2].0.server_id, ServerId::new(1, 0));
        assert_eq!(events[2].1, ServerChangeEvent::Removed);
        Ok(())
    }

    #[test]
    fn reenlistment_replaces_old_incarnation() -> Result<(), MemRepError> {
        let list = ServerList::new();
        let tracker = Arc::new(Mutex::new(ServerTracker::<u32>::new()));
        list.register(tracker.clone());

        list.add(details(1, 0))?;
        assert!(list.add(details(1, 0)).is_err());
        list.add(details(1, 1))?; // same index, next generation

        let mut tr = tracker.lock().unwrap();
        let events: Vec<_> = std::iter::from_fn(|| tr.get_change()).collect();
        let kinds: Vec<_> = events.iter().map(|(d, e)| (d.server_id, *e)).collect();
        assert_eq!(
            kinds,
            vec![
                (ServerId::new(1, 0), ServerChangeEvent::Added),
                (ServerId::new(1, 0), ServerChangeEvent::Removed),
                (ServerId::new(1, 1), ServerChangeEvent::Added),
            ]
        );
        Ok(())
    }

    #[test]
    fn full_list_diffing() -> Result<(), MemRepError> {
        let list = ServerList::new();
        list.add(details(1, 0))?;
        list.add(details(2, 0))?;

        let entries = vec![
            ServerEntry {
                service_mask: ServiceMask::BACKUP.to_u32(),
                server_id: ServerId::new(2, 0).to_u64(),
                segment_id: 0,
                locator: "tcp:host=backup2".into(),
                user_data: 100,
                is_in_cluster: true,
            },
            ServerEntry {
                service_mask: ServiceMask::BACKUP.to_u32(),
                server_id: ServerId::new(3, 0).to_u64(),
                segment_id: 0,
                locator: "tcp:host=backup3".into(),
                user_data: 100,
                is_in_cluster: true,
            },
            ServerEntry {
                service_mask: ServiceMask::BACKUP.to_u32(),
                server_id: ServerId::new(4, 0).to_u64(),
                segment_id: 0,
                locator: "tcp:host=backup4".into(),
                user_data: 100,
                is_in_cluster: false,
            },
        ];
        list.apply_full_list(&entries, 9)?;

        assert_eq!(list.version(), 9);
        assert!(list.locator(ServerId::new(1, 0)).is_err());
        assert_eq!(
            list.locator(ServerId::new(2, 0))?,
            "tcp:host=backup2".to_string()
        );
        assert_eq!(
            list.locator(ServerId::new(3, 0))?,
            "tcp:host=backup3".to_string()
        );
        assert!(list.locator(ServerId::new(4, 0)).is_err());

        // stale pushes are rejected
        assert!(list.apply_full_list(&[], 3).is_err());
        Ok(())
    }
}
