//! Operation identifiers and state vectors.
//!
//! Every operation is tagged with `(replica, clock)`. A replica's clock
//! starts at 0 and advances by one per inserted character and by one per
//! delete mark, so a replica's history is a gap-free sequence of clocks.
//! The state vector records, per replica, the next clock not yet integrated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::DocumentError;

/// Identifies one replica of a document for the lifetime of a session.
pub type ReplicaId = Uuid;

/// Unique id of a single character block or delete mark.
///
/// Ordered by replica first, then clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }

    /// The id `n` clocks after this one on the same replica.
    pub fn offset(&self, n: u64) -> Self {
        Self {
            replica: self.replica,
            clock: self.clock + n,
        }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = &self.replica.simple().to_string()[..8];
        write!(f, "{short}@{}", self.clock)
    }
}

/// A run of consecutive clocks on one replica, used by delete marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub replica: ReplicaId,
    pub start: u64,
    pub len: u64,
}

impl IdRange {
    pub fn new(replica: ReplicaId, start: u64, len: u64) -> Self {
        Self { replica, start, len }
    }

    /// One past the last clock in the range.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn contains(&self, id: &OpId) -> bool {
        id.replica == self.replica && id.clock >= self.start && id.clock < self.end()
    }

    pub fn ids(&self) -> impl Iterator<Item = OpId> + '_ {
        (self.start..self.end()).map(move |clock| OpId::new(self.replica, clock))
    }

    /// Compress ids into ranges. Ids must be grouped so that runs are adjacent.
    pub fn compress(ids: impl IntoIterator<Item = OpId>) -> Vec<IdRange> {
        let mut ranges: Vec<IdRange> = Vec::new();
        for id in ids {
            match ranges.last_mut() {
                Some(last) if last.replica == id.replica && last.end() == id.clock => {
                    last.len += 1;
                }
                _ => ranges.push(IdRange::new(id.replica, id.clock, 1)),
            }
        }
        ranges
    }
}

/// Per-replica "next clock" summary of everything a document has integrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Next clock expected from `replica` (0 if never seen).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Whether the operation with this id has been integrated.
    pub fn contains(&self, id: &OpId) -> bool {
        id.clock < self.get(&id.replica)
    }

    /// Raise the next clock for `replica` to at least `next`.
    pub fn advance(&mut self, replica: ReplicaId, next: u64) {
        let entry = self.0.entry(replica).or_insert(0);
        if next > *entry {
            *entry = next;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every operation known here is also known to `other`.
    pub fn dominated_by(&self, other: &StateVector) -> bool {
        self.0.iter().all(|(replica, clock)| other.get(replica) >= *clock)
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DocumentError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        Ok(sv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_vector_contains() {
        let replica = Uuid::new_v4();
        let mut sv = StateVector::new();
        assert!(!sv.contains(&OpId::new(replica, 0)));

        sv.advance(replica, 3);
        assert!(sv.contains(&OpId::new(replica, 2)));
        assert!(!sv.contains(&OpId::new(replica, 3)));
    }

    #[test]
    fn test_state_vector_advance_never_regresses() {
        let replica = Uuid::new_v4();
        let mut sv = StateVector::new();
        sv.advance(replica, 5);
        sv.advance(replica, 2);
        assert_eq!(sv.get(&replica), 5);
    }

    #[test]
    fn test_state_vector_dominated_by() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut small = StateVector::new();
        small.advance(a, 2);
        let mut big = StateVector::new();
        big.advance(a, 4);
        big.advance(b, 1);

        assert!(small.dominated_by(&big));
        assert!(!big.dominated_by(&small));
    }

    #[test]
    fn test_state_vector_roundtrip() {
        let mut sv = StateVector::new();
        sv.advance(Uuid::new_v4(), 10);
        sv.advance(Uuid::new_v4(), 1);

        let decoded = StateVector::decode(&sv.encode().unwrap()).unwrap();
        assert_eq!(decoded, sv);
    }

    #[test]
    fn test_id_range_compress() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ids = vec![
            OpId::new(a, 0),
            OpId::new(a, 1),
            OpId::new(a, 2),
            OpId::new(b, 7),
            OpId::new(a, 5),
        ];
        let ranges = IdRange::compress(ids);
        assert_eq!(
            ranges,
            vec![IdRange::new(a, 0, 3), IdRange::new(b, 7, 1), IdRange::new(a, 5, 1)]
        );
        assert!(ranges[0].contains(&OpId::new(a, 2)));
        assert!(!ranges[0].contains(&OpId::new(a, 3)));
    }

    #[test]
    fn test_decode_garbage_state_vector() {
        assert!(StateVector::decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
