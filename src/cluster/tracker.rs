//! Per-subscriber server change tracker module implementation.
//!
//! Each subscriber of the server list owns one tracker. The list enqueues
//! `Added`/`Removed` events into every registered tracker; the subscriber
//! drains them at its own pace through `get_change()` and may attach one
//! opaque annotation per tracked server. Slots are indexed densely by the
//! server id's index number and checked against its generation number, so
//! annotation lookups never touch a hash table and slot indices stay stable
//! across the subscriber's view.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::{ServerId, ServiceMask};
use crate::utils::MemRepError;

/// Everything a subscriber may need to know about a tracked server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerDetails {
    /// Identity of the server process.
    pub server_id: ServerId,

    /// Services the server offers.
    pub services: ServiceMask,

    /// Network locator the server listens on.
    pub locator: String,

    /// Payload for higher layers; opaque to the directory itself. Backups
    /// publish their advertised read speed (MB/s) here.
    pub user_data: u64,
}

impl ServerDetails {
    /// Shorthand constructor, mostly for tests and enlistment glue.
    pub fn new(
        server_id: ServerId,
        services: ServiceMask,
        locator: impl Into<String>,
        user_data: u64,
    ) -> Self {
        ServerDetails {
            server_id,
            services,
            locator: locator.into(),
            user_data,
        }
    }
}

/// Kinds of server list mutations a subscriber observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerChangeEvent {
    /// Server enlisted into the cluster.
    Added,

    /// Server authoritatively departed the cluster.
    Removed,
}

/// One dense slot of the tracker's view; identity is only filled in once the
/// subscriber has consumed the corresponding `Added` event.
struct TrackerSlot<T> {
    /// Identity and details of the server occupying this index, if any.
    details: Option<ServerDetails>,

    /// Subscriber-attached annotation for this server.
    annotation: Option<T>,
}

impl<T> Default for TrackerSlot<T> {
    fn default() -> Self {
        TrackerSlot {
            details: None,
            annotation: None,
        }
    }
}

/// Per-subscriber serialized view over server list mutations.
pub struct ServerTracker<T> {
    /// Dense index-stable slots of tracked servers.
    slots: Vec<TrackerSlot<T>>,

    /// FIFO of not-yet-consumed change events.
    changes: VecDeque<(ServerDetails, ServerChangeEvent)>,

    /// Index whose `Removed` event was handed out by the last `get_change()`
    /// and whose slot must be scrubbed on the next call.
    last_removed: Option<u32>,

    /// Number of servers currently present in the consumed view.
    num_present: usize,

    /// Optional "changes pending" callback fired on every enqueue.
    notify: Option<Box<dyn Fn() + Send>>,
}

impl<T> ServerTracker<T> {
    /// Creates a new, empty tracker.
    pub fn new() -> Self {
        ServerTracker {
            slots: vec![],
            changes: VecDeque::new(),
            last_removed: None,
            num_present: 0,
            notify: None,
        }
    }

    /// Installs a callback invoked whenever a change gets enqueued.
    pub fn set_notify(&mut self, notify: impl Fn() + Send + 'static) {
        self.notify = Some(Box::new(notify));
    }

    /// Appends a change event to the FIFO. For `Added`, reserves a slot at
    /// the server's index (growing the slot vector if needed); identity is
    /// not filled in until the subscriber consumes the event.
    pub fn enqueue_change(
        &mut self,
        details: ServerDetails,
        event: ServerChangeEvent,
    ) {
        let index = details.server_id.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, TrackerSlot::default);
        }
        self.changes.push_back((details, event));

        if let Some(notify) = &self.notify {
            notify();
        }
    }

    /// True if there are pending change events to consume.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Pops the oldest pending change event, applying it to the tracked
    /// view. After handing out a `Removed`, the slot's identity and
    /// annotation are only cleared on the *next* call; the subscriber is
    /// expected to have dropped its annotation by then, and violations are
    /// reported with a warning before clearing.
    pub fn get_change(
        &mut self,
    ) -> Option<(ServerDetails, ServerChangeEvent)> {
        if let Some(index) = self.last_removed.take() {
            let slot = &mut self.slots[index as usize];
            if slot.annotation.is_some() {
                pf_warn!(
                    "tracker";
                    "subscriber did not clear annotation for index {} past removal",
                    index
                );
            }
            slot.details = None;
            slot.annotation = None;
        }

        let (details, event) = self.changes.pop_front()?;
        let index = details.server_id.index() as usize;
        match event {
            ServerChangeEvent::Added => {
                self.slots[index].details = Some(details.clone());
                self.num_present += 1;
            }
            ServerChangeEvent::Removed => {
                self.last_removed = Some(index as u32);
                self.num_present = self.num_present.saturating_sub(1);
            }
        }
        Some((details, event))
    }

    /// Number of servers in the consumed view. Grows only after draining
    /// `Added` events and shrinks only after draining `Removed` events.
    pub fn size(&self) -> usize {
        self.num_present
    }

    /// Reference to the slot occupied by the given id, or `Err` if the id
    /// (including its generation number) is not currently tracked.
    fn slot_of(&self, id: ServerId) -> Result<usize, MemRepError> {
        let index = id.index() as usize;
        match self.slots.get(index).and_then(|s| s.details.as_ref()) {
            Some(details) if details.server_id == id => Ok(index),
            _ => Err(MemRepError(format!("server {} not tracked", id))),
        }
    }

    /// Read access to the annotation attached to the given server.
    pub fn annotation(
        &self,
        id: ServerId,
    ) -> Result<&Option<T>, MemRepError> {
        let index = self.slot_of(id)?;
        Ok(&self.slots[index].annotation)
    }

    /// Write access to the annotation attached to the given server.
    pub fn annotation_mut(
        &mut self,
        id: ServerId,
    ) -> Result<&mut Option<T>, MemRepError> {
        let index = self.slot_of(id)?;
        Ok(&mut self.slots[index].annotation)
    }

    /// True if the given id currently occupies its slot.
    pub fn contains(&self, id: ServerId) -> bool {
        self.slot_of(id).is_ok()
    }

    /// Network locator of the given server.
    pub fn locator(&self, id: ServerId) -> Result<String, MemRepError> {
        let index = self.slot_of(id)?;
        Ok(self.slots[index].details.as_ref().unwrap().locator.clone())
    }

    /// Details of the given server.
    pub fn details(
        &self,
        id: ServerId,
    ) -> Result<&ServerDetails, MemRepError> {
        let index = self.slot_of(id)?;
        Ok(self.slots[index].details.as_ref().unwrap())
    }

    /// Uniform-random selection among currently-present servers whose
    /// service mask covers `services`. Returns the invalid id if no tracked
    /// server matches.
    pub fn random_with_service(&self, services: ServiceMask) -> ServerId {
        let matching: Vec<ServerId> = self
            .slots
            .iter()
            .filter_map(|s| s.details.as_ref())
            .filter(|d| d.services.has(services))
            .map(|d| d.server_id)
            .collect();
        match matching.choose(&mut thread_rng()) {
            Some(&id) => id,
            None => ServerId::INVALID,
        }
    }

    /// Iterates over the details of all currently-present servers.
    pub fn iter(&self) -> impl Iterator<Item = &ServerDetails> {
        self.slots.iter().filter_map(|s| s.details.as_ref())
    }
}

impl<T> Default for ServerTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe enqueue seam through which the server list feeds events into
/// subscriber trackers of any annotation type.
pub trait TrackerSink: Send + Sync {
    /// Enqueues one change event into the subscriber's FIFO.
    fn enqueue_change(
        &self,
        details: ServerDetails,
        event: ServerChangeEvent,
    );
}

impl<T: Send> TrackerSink for Mutex<ServerTracker<T>> {
    fn enqueue_change(
        &self,
        details: ServerDetails,
        event: ServerChangeEvent,
    ) {
        self.lock().unwrap().enqueue_change(details, event);
    }
}

#[cfg(test)]
mod tracker_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn backup_details(index: u32, generation: u32) -> ServerDetails {
        ServerDetails::new(
            ServerId::new(index, generation),
            ServiceMask::BACKUP,
            format!("tcp:host=backup{}", index),
            0,
        )
    }

    #[test]
    fn enqueue_reserves_slot() {
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        assert_eq!(tr.size(), 0);
        tr.enqueue_change(backup_details(2, 0), ServerChangeEvent::Added);
        // slot reserved but nothing present until consumed
        assert_eq!(tr.size(), 0);
        assert_eq!(
            tr.random_with_service(ServiceMask::BACKUP),
            ServerId::INVALID
        );
        assert!(tr.has_changes());

        let (details, event) = tr.get_change().unwrap();
        assert_eq!(details.server_id, ServerId::new(2, 0));
        assert_eq!(event, ServerChangeEvent::Added);
        assert_eq!(tr.size(), 1);
        assert!(!tr.has_changes());
    }

    #[test]
    fn notify_fires_on_enqueue() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_ref = fired.clone();
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        tr.set_notify(move || {
            fired_ref.fetch_add(1, Ordering::SeqCst);
        });

        tr.enqueue_change(backup_details(0, 0), ServerChangeEvent::Added);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tr.enqueue_change(backup_details(0, 0), ServerChangeEvent::Removed);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_slot_scrubbed_next_call() -> Result<(), MemRepError> {
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        let id = ServerId::new(2, 0);
        tr.enqueue_change(backup_details(2, 0), ServerChangeEvent::Added);
        tr.get_change().unwrap();
        *tr.annotation_mut(id)? = Some(57);

        tr.enqueue_change(backup_details(2, 0), ServerChangeEvent::Removed);
        // annotation still reachable until the removal is consumed and one
        // more get_change() call scrubs the slot
        assert_eq!(*tr.annotation(id)?, Some(57));
        let (_, event) = tr.get_change().unwrap();
        assert_eq!(event, ServerChangeEvent::Removed);
        assert_eq!(tr.size(), 0);
        assert_eq!(*tr.annotation(id)?, Some(57));

        // contract violation: annotation left non-null; warned and cleared
        assert!(tr.get_change().is_none());
        assert!(tr.annotation(id).is_err());
        assert!(tr.locator(id).is_err());
        Ok(())
    }

    #[test]
    fn annotation_generation_mismatch() -> Result<(), MemRepError> {
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        tr.enqueue_change(backup_details(0, 1), ServerChangeEvent::Added);
        tr.get_change().unwrap();
        *tr.annotation_mut(ServerId::new(0, 1))? = Some(45);
        assert!(tr.annotation(ServerId::new(0, 2)).is_err());
        assert!(tr.annotation(ServerId::new(1, 1)).is_err());
        assert_eq!(*tr.annotation(ServerId::new(0, 1))?, Some(45));
        Ok(())
    }

    #[test]
    fn random_with_service_filters() {
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        let master = ServerDetails::new(
            ServerId::new(1, 1),
            ServiceMask::MASTER,
            "tcp:host=master1",
            0,
        );
        tr.enqueue_change(master, ServerChangeEvent::Added);
        tr.get_change().unwrap();

        for _ in 0..10 {
            assert_eq!(
                tr.random_with_service(ServiceMask::MASTER),
                ServerId::new(1, 1)
            );
            // no host available with this service bit set
            assert_eq!(
                tr.random_with_service(ServiceMask::BACKUP),
                ServerId::INVALID
            );
        }

        // ensure selection over the empty view terminates
        tr.enqueue_change(
            ServerDetails::new(
                ServerId::new(1, 1),
                ServiceMask::NONE,
                "",
                0,
            ),
            ServerChangeEvent::Removed,
        );
        tr.get_change().unwrap();
        tr.get_change();
        assert_eq!(
            tr.random_with_service(ServiceMask::MASTER),
            ServerId::INVALID
        );
    }

    #[test]
    fn random_with_service_even_distribution() {
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        for index in 1..=3 {
            tr.enqueue_change(
                backup_details(index, 0),
                ServerChangeEvent::Added,
            );
            tr.get_change().unwrap();
        }
        assert_eq!(tr.size(), 3);

        let mut counts = [0u32; 3];
        for _ in 0..10000 {
            let id = tr.random_with_service(ServiceMask::BACKUP);
            counts[(id.index() - 1) as usize] += 1;
        }
        // each backup should be selected about 1/3 of the time
        for count in counts {
            assert_eq!(count / 1000, 3);
        }
    }

    #[test]
    fn size_post_consumption() {
        let mut tr: ServerTracker<u32> = ServerTracker::new();
        tr.enqueue_change(backup_details(0, 0), ServerChangeEvent::Added);
        assert_eq!(tr.size(), 0);
        tr.get_change().unwrap();
        assert_eq!(tr.size(), 1);

        tr.enqueue_change(backup_details(0, 0), ServerChangeEvent::Removed);
        assert_eq!(tr.size(), 1);
        tr.get_change().unwrap();
        assert_eq!(tr.size(), 0);
    }
}
