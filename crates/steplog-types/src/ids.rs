//! Index newtypes for host-assigned identifiers.
//!
//! The transport host hands out plain non-negative integers for volumes and
//! tracks. They are used directly as offsets into sparse tables, so the
//! wrappers stay `Copy` and expose [`index`](VolumeId::index) for slot
//! addressing. Wrapping them prevents a track ID from being used to index a
//! volume table.

use serde::{Deserialize, Serialize};

/// Generates an index newtype around `u32` with standard derives.
macro_rules! define_index {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Wrap a raw identifier.
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Return the raw identifier.
            pub const fn into_inner(self) -> u32 {
                self.0
            }

            /// Return the identifier as a table slot offset.
            pub fn index(self) -> usize {
                usize::try_from(self.0).unwrap_or(usize::MAX)
            }

            /// Convert a signed host-side identifier.
            ///
            /// Hosts use negative values to mean "none"; those map to `None`.
            pub fn from_signed(raw: i64) -> Option<Self> {
                u32::try_from(raw).ok().map(Self)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_index! {
    /// Identifier of a geometry volume, as assigned by the transport host.
    VolumeId
}

define_index! {
    /// Identifier of a simulated track, unique within one event.
    TrackId
}

/// Copy number of a volume placement. Never used as a table offset.
pub type CopyNo = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_host_ids_mean_none() {
        assert_eq!(TrackId::from_signed(-1), None);
        assert_eq!(TrackId::from_signed(7), Some(TrackId(7)));
    }

    #[test]
    fn index_matches_raw_value() {
        assert_eq!(VolumeId::new(42).index(), 42);
        assert_eq!(u32::from(VolumeId::from(9)), 9);
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&VolumeId(12)).ok();
        assert_eq!(json.as_deref(), Some("12"));
    }
}
