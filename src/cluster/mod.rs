//! Cluster directory functionality modules: server identities, the versioned
//! server list, and per-subscriber change trackers.

mod id;
mod list;
mod tracker;

pub use id::{ServerId, ServiceMask};
pub use list::{ServerEntry, ServerList};
pub use tracker::{
    ServerChangeEvent, ServerDetails, ServerTracker, TrackerSink,
};
