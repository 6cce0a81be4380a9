pub mod types;

use crate::error::AccessError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KIND_TAG_BITS: u32 = 4;
pub const KIND_TAG_MASK: i64 = (1 << KIND_TAG_BITS) - 1;
pub const MAX_KIND_TAGS: usize = 1 << KIND_TAG_BITS;
pub const MAX_SEQUENCE: i64 = i64::MAX >> KIND_TAG_BITS;

pub const HEAP_KIND: u8 = 0;
pub const BTREE_KIND: u8 = 1;

pub const PERSISTENT_SEGMENT: u32 = 0;
pub const TEMPORARY_SEGMENT: u32 = u32::MAX;

/// Conglomerate identifier. Bits [3:0] carry the kind tag and bits [63:4] a
/// sequence number; negative values are transaction-local temporaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConglomerateId(pub i64);

impl ConglomerateId {
    pub fn encode(kind_tag: u8, sequence: i64) -> Result<Self, AccessError> {
        if usize::from(kind_tag) >= MAX_KIND_TAGS {
            return Err(AccessError::ProtocolViolation(format!(
                "kind tag {kind_tag} does not fit in {KIND_TAG_BITS} bits"
            )));
        }
        if !(0..=MAX_SEQUENCE).contains(&sequence) {
            return Err(AccessError::ProtocolViolation(format!(
                "conglomerate sequence {sequence} out of range"
            )));
        }
        Ok(Self((sequence << KIND_TAG_BITS) | i64::from(kind_tag)))
    }

    pub fn kind_tag(self) -> u8 {
        (self.0 & KIND_TAG_MASK) as u8
    }

    pub fn sequence(self) -> i64 {
        self.0 >> KIND_TAG_BITS
    }

    pub fn is_temporary(self) -> bool {
        self.0 < 0
    }

    /// Container backing a persistent conglomerate. Temporaries live in the
    /// temporary segment under a store-assigned id instead.
    pub fn persistent_container(self) -> ContainerKey {
        ContainerKey {
            segment: PERSISTENT_SEGMENT,
            container_id: self.0,
        }
    }
}

impl std::fmt::Display for ConglomerateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerKey {
    pub segment: u32,
    pub container_id: i64,
}

impl ContainerKey {
    pub fn is_temporary(&self) -> bool {
        self.segment == TEMPORARY_SEGMENT
    }
}

impl std::fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_temporary() {
            write!(f, "container(temp, {})", self.container_id)
        } else {
            write!(f, "container({}, {})", self.segment, self.container_id)
        }
    }
}

/// Creation-time properties handed to a conglomerate factory.
pub type ConglomerateProperties = BTreeMap<String, String>;

/// Ordered conglomerates reject a second row with equal key columns when this
/// is `"false"`.
pub const PROP_ALLOW_DUPLICATES: &str = "allowDuplicates";

pub fn allows_duplicates(props: &ConglomerateProperties) -> bool {
    props
        .get(PROP_ALLOW_DUPLICATES)
        .map(|v| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::{BTREE_KIND, ConglomerateId, HEAP_KIND, MAX_SEQUENCE, PERSISTENT_SEGMENT};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn kind_tag_survives_encoding(kind in 0u8..16, seq in 0i64..=MAX_SEQUENCE) {
            let id = ConglomerateId::encode(kind, seq).expect("encode");
            prop_assert_eq!(id.kind_tag(), kind);
            prop_assert_eq!(id.sequence(), seq);
            prop_assert!(!id.is_temporary());
        }
    }

    #[test]
    fn negative_ids_are_temporary() {
        assert!(ConglomerateId(-1).is_temporary());
        assert!(!ConglomerateId(0).is_temporary());
    }

    #[test]
    fn encode_rejects_wide_kind_tags_and_negative_sequences() {
        assert!(ConglomerateId::encode(16, 1).is_err());
        assert!(ConglomerateId::encode(HEAP_KIND, -1).is_err());
        let id = ConglomerateId::encode(BTREE_KIND, 3).expect("encode");
        assert_eq!(id.0, 0x31);
        assert_eq!(id.persistent_container().segment, PERSISTENT_SEGMENT);
        assert_eq!(id.persistent_container().container_id, 0x31);
    }
}
