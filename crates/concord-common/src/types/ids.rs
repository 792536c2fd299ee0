//! Identifiers shared by every crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a `Copy` newtype over an integer with `0` reserved as invalid.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($repr:ty), $as_raw:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Sentinel that never names a real entity.
            pub const INVALID: Self = Self(0);

            #[inline]
            #[must_use]
            pub const fn new(raw: $repr) -> Self {
                Self(raw)
            }

            #[inline]
            #[must_use]
            pub const fn $as_raw(self) -> $repr {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl From<$repr> for $name {
            #[inline]
            fn from(raw: $repr) -> Self {
                Self(raw)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, concat!(stringify!($name), "({})"), self)
                } else {
                    f.write_str(concat!(stringify!($name), "(INVALID)"))
                }
            }
        }
    };
}

/// Low bits of a [`TxnId`] holding the coordinator-local sequence.
const TXN_SEQUENCE_BITS: u32 = 40;
const TXN_SEQUENCE_MASK: u64 = (1 << TXN_SEQUENCE_BITS) - 1;

id_type! {
    /// Globally unique transaction id.
    ///
    /// The high 24 bits name the coordinator that allocated it and the low
    /// 40 bits are that coordinator's sequence, so an in-doubt participant
    /// can find the coordinator from the id alone.
    ///
    /// ```rust
    /// use concord_common::types::{NodeId, TxnId};
    ///
    /// let txn = TxnId::compose(NodeId::new(3), 42);
    /// assert_eq!(txn.coordinator(), NodeId::new(3));
    /// assert_eq!(txn.to_string(), "3.42");
    /// ```
    TxnId(u64), as_u64
}

impl TxnId {
    /// Largest node id that can coordinate transactions.
    pub const MAX_COORDINATOR: NodeId = NodeId::new((1 << (64 - TXN_SEQUENCE_BITS)) - 1);

    /// Packs `coordinator` and `sequence`. The coordinator must not exceed
    /// [`MAX_COORDINATOR`](Self::MAX_COORDINATOR); the sequence wraps.
    #[inline]
    #[must_use]
    pub const fn compose(coordinator: NodeId, sequence: u64) -> Self {
        debug_assert!(
            coordinator.as_u32() <= Self::MAX_COORDINATOR.as_u32(),
            "coordinator id does not fit a transaction id"
        );
        Self(((coordinator.as_u32() as u64) << TXN_SEQUENCE_BITS) | (sequence & TXN_SEQUENCE_MASK))
    }

    /// Like [`compose`](Self::compose), but `None` when either part would
    /// be truncated.
    #[inline]
    #[must_use]
    pub const fn try_compose(coordinator: NodeId, sequence: u64) -> Option<Self> {
        if coordinator.as_u32() > Self::MAX_COORDINATOR.as_u32() || sequence > TXN_SEQUENCE_MASK {
            None
        } else {
            Some(Self::compose(coordinator, sequence))
        }
    }

    #[inline]
    #[must_use]
    pub const fn coordinator(self) -> NodeId {
        NodeId::new((self.0 >> TXN_SEQUENCE_BITS) as u32)
    }

    #[inline]
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0 & TXN_SEQUENCE_MASK
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.coordinator(), self.sequence())
    }
}

id_type! {
    /// Position of a record in one node's log. Strictly increasing.
    Lsn(u64), as_u64
}

impl Lsn {
    pub const FIRST: Self = Self(1);

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

id_type! {
    /// Cluster member id, fixed in configuration and stable across restarts.
    NodeId(u32), as_u32
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_embeds_coordinator() {
        let txn = TxnId::compose(NodeId::new(7), 1234);
        assert_eq!(txn.coordinator(), NodeId::new(7));
        assert_eq!(txn.sequence(), 1234);
        assert!(txn.is_valid());
        assert_ne!(txn, TxnId::compose(NodeId::new(8), 1234));
    }

    #[test]
    fn test_sequence_is_masked() {
        let txn = TxnId::compose(NodeId::new(1), TXN_SEQUENCE_MASK + 5);
        assert_eq!(txn.coordinator(), NodeId::new(1));
        assert_eq!(txn.sequence(), 4);
    }

    #[test]
    fn test_coordinator_id_boundary() {
        let max = TxnId::MAX_COORDINATOR;
        assert_eq!(max.as_u32(), (1 << 24) - 1);

        let txn = TxnId::try_compose(max, 7).unwrap();
        assert_eq!(txn.coordinator(), max);
        assert_eq!(txn.sequence(), 7);

        // One past the boundary would alias node 0's or node 1's ids.
        assert!(TxnId::try_compose(NodeId::new(1 << 24), 7).is_none());
        assert!(TxnId::try_compose(NodeId::new((1 << 24) + 1), 7).is_none());
        assert!(TxnId::try_compose(NodeId::new(1), TXN_SEQUENCE_MASK + 1).is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit")]
    fn test_compose_rejects_wide_coordinator() {
        let _ = TxnId::compose(NodeId::new((1 << 24) + 1), 7);
    }

    #[test]
    fn test_invalid_sentinels() {
        assert!(!TxnId::INVALID.is_valid());
        assert!(!Lsn::INVALID.is_valid());
        assert!(!NodeId::INVALID.is_valid());
        assert_eq!(format!("{:?}", NodeId::INVALID), "NodeId(INVALID)");
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format!("{:?}", TxnId::compose(NodeId::new(2), 9)), "TxnId(2.9)");
        assert_eq!(format!("{:?}", Lsn::new(11)), "Lsn(11)");
        assert_eq!(NodeId::from(4).to_string(), "4");
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::FIRST > Lsn::INVALID);
        assert_eq!(Lsn::new(10).next(), Lsn::new(11));
        assert!(Lsn::new(1) < Lsn::new(2));
    }
}
