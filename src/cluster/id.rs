//! Server identity and service mask types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generation number marking a `ServerId` as invalid. Any id carrying this
/// generation (despite the index value) is invalid; the coordinator never
/// allocates it.
const INVALID_GENERATION: u32 = u32::MAX;

/// Unique identifier of a server process enlisted in the cluster.
///
/// An id consists of a 32-bit index and a 32-bit generation number, packed
/// as `(generation << 32) | index`. The coordinator allocates ids densely:
/// the lowest free index is reused while the generation number for that index
/// only ever grows. Lookups can therefore index into a vector and compare
/// generations instead of going through a hash table. Index 0 is reserved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ServerId(u64);

impl ServerId {
    /// The invalid id; useful as an "unset" sentinel.
    pub const INVALID: ServerId =
        ServerId((INVALID_GENERATION as u64) << 32);

    /// Constructs an id from its index and generation numbers.
    pub fn new(index: u32, generation: u32) -> Self {
        ServerId(((generation as u64) << 32) | (index as u64))
    }

    /// Reconstructs an id from its serialized `u64` form.
    pub fn from_u64(id: u64) -> Self {
        ServerId(id)
    }

    /// Obtains the id's serialized `u64` form.
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// The reusable index portion of the id.
    pub fn index(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// The generation number for this id's index.
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// False if the generation number marks this id invalid.
    pub fn is_valid(self) -> bool {
        self.generation() != INVALID_GENERATION
    }

    /// Equality that treats all invalid ids as equal regardless of index.
    pub fn same_as(self, other: ServerId) -> bool {
        if !self.is_valid() && !other.is_valid() {
            return true;
        }
        self.0 == other.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}.{}", self.index(), self.generation())
        } else {
            write!(f, "invalid")
        }
    }
}

/// Bitmask of services a server process offers to the cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
)]
pub struct ServiceMask(u32);

impl ServiceMask {
    /// Serves in-memory objects and replicates its log to backups.
    pub const MASTER: ServiceMask = ServiceMask(1 << 0);
    /// Durably stores replicas of masters' segments.
    pub const BACKUP: ServiceMask = ServiceMask(1 << 1);
    /// Receives server list updates pushed by the coordinator.
    pub const MEMBERSHIP: ServiceMask = ServiceMask(1 << 2);
    /// Answers liveness probes.
    pub const PING: ServiceMask = ServiceMask(1 << 3);

    /// The empty mask.
    pub const NONE: ServiceMask = ServiceMask(0);

    /// Reconstructs a mask from its serialized `u32` form.
    pub fn from_u32(mask: u32) -> Self {
        ServiceMask(mask)
    }

    /// Obtains the mask's serialized `u32` form.
    pub fn to_u32(self) -> u32 {
        self.0
    }

    /// True if every service in `other` is also offered by `self`.
    pub fn has(self, other: ServiceMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combines two masks.
    pub fn with(self, other: ServiceMask) -> ServiceMask {
        ServiceMask(self.0 | other.0)
    }
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        for (index, generation) in
            [(1, 0), (77, 3), (u32::MAX, 0), (1, u32::MAX - 1)]
        {
            let id = ServerId::new(index, generation);
            assert_eq!(ServerId::from_u64(id.to_u64()), id);
            assert_eq!(id.index(), index);
            assert_eq!(id.generation(), generation);
            assert!(id.is_valid());
        }
    }

    #[test]
    fn id_invalid() {
        assert!(!ServerId::INVALID.is_valid());
        assert!(!ServerId::new(42, u32::MAX).is_valid());
        // invalid is invalid, regardless of the index number
        assert!(ServerId::INVALID.same_as(ServerId::new(42, u32::MAX)));
        assert!(!ServerId::new(1, 0).same_as(ServerId::new(1, 1)));
        assert!(ServerId::new(5, 2).same_as(ServerId::new(5, 2)));
    }

    #[test]
    fn id_display() {
        assert_eq!(format!("{}", ServerId::new(3, 1)), "3.1");
        assert_eq!(format!("{}", ServerId::INVALID), "invalid");
    }

    #[test]
    fn mask_contains() {
        let mask = ServiceMask::MASTER.with(ServiceMask::PING);
        assert!(mask.has(ServiceMask::MASTER));
        assert!(mask.has(ServiceMask::PING));
        assert!(!mask.has(ServiceMask::BACKUP));
        assert!(mask.has(ServiceMask::NONE));
        assert_eq!(ServiceMask::from_u32(mask.to_u32()), mask);
    }
}
