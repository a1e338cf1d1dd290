use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::oid::ObjectId;

/// Identifier of a finalized pack: the SHA-1 digest of the pack's
/// member object IDs in sorted order. A pack is addressed by what it
/// contains, not by upload order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackId(pub [u8; 20]);

impl PackId {
    /// Compute a pack ID from its member object IDs. The caller passes
    /// the IDs in any order; sorting happens here.
    pub fn compute(ids: &[ObjectId]) -> Self {
        let mut sorted: Vec<&ObjectId> = ids.iter().collect();
        sorted.sort();
        let mut hasher = Sha1::new();
        for id in sorted {
            hasher.update(id.as_bytes());
        }
        PackId(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Storage name of the pack file.
    pub fn pack_name(&self) -> String {
        format!("objects/pack/pack-{}.pack", self.to_hex())
    }

    /// Storage name of the companion index.
    pub fn idx_name(&self) -> String {
        format!("objects/pack/pack-{}.idx", self.to_hex())
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
