use sha1::{Digest, Sha1};

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::{ObjectId, ObjectKind};
use cairn_types::pack_id::PackId;

use super::{PackRecord, CRC_VALUE_MASK};

/// Magic bytes of a version-2 pack index.
pub const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
pub const IDX_VERSION: u32 = 2;

/// Offsets with this bit set index into the trailing 64-bit table.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

const FANOUT_SIZE: usize = 256 * 4;
const HEADER_SIZE: usize = 8;
const FOOTER_SIZE: usize = 40; // pack digest + idx digest

/// One lookup result: where the object's record starts in the pack,
/// plus the type tag when the idx carries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxEntry {
    pub offset: u64,
    pub crc: u32,
    pub kind: Option<ObjectKind>,
}

/// Serialize a version-2 idx for one sealed pack. `records` must be
/// sorted by object ID (as produced by `PackWriter::seal`).
pub fn encode_idx(records: &[PackRecord], pack_trailer: &[u8; 20]) -> Vec<u8> {
    debug_assert!(records.windows(2).all(|w| w[0].id < w[1].id));

    let mut large_offsets: Vec<u64> = Vec::new();
    let n = records.len();
    let mut out = Vec::with_capacity(HEADER_SIZE + FANOUT_SIZE + n * 28 + FOOTER_SIZE);

    out.extend_from_slice(&IDX_MAGIC);
    out.extend_from_slice(&IDX_VERSION.to_be_bytes());

    // fanout[b] = count of IDs whose first byte <= b
    let mut fanout = [0u32; 256];
    for record in records {
        fanout[record.id.first_byte() as usize] += 1;
    }
    let mut running = 0u32;
    for slot in fanout.iter_mut() {
        running += *slot;
        *slot = running;
    }
    for count in fanout {
        out.extend_from_slice(&count.to_be_bytes());
    }

    for record in records {
        out.extend_from_slice(record.id.as_bytes());
    }
    for record in records {
        out.extend_from_slice(&record.crc.to_be_bytes());
    }
    for record in records {
        if record.offset < LARGE_OFFSET_FLAG as u64 {
            out.extend_from_slice(&(record.offset as u32).to_be_bytes());
        } else {
            let index = large_offsets.len() as u32;
            large_offsets.push(record.offset);
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | index).to_be_bytes());
        }
    }
    for offset in &large_offsets {
        out.extend_from_slice(&offset.to_be_bytes());
    }

    out.extend_from_slice(pack_trailer);
    let mut hasher = Sha1::new();
    hasher.update(&out);
    let digest: [u8; 20] = hasher.finalize().into();
    out.extend_from_slice(&digest);
    out
}

/// Parsed, digest-validated index over one pack.
pub struct PackIdx {
    pub pack_id: PackId,
    /// Storage name this idx was loaded from (for error reporting).
    pub name: String,
    fanout: [u32; 256],
    ids: Vec<ObjectId>,
    crcs: Vec<u32>,
    offsets: Vec<u64>,
    pub pack_trailer: [u8; 20],
    type_in_crc: bool,
}

impl PackIdx {
    /// Parse and validate idx bytes. `type_in_crc` selects whether the
    /// CRC high bits are interpreted as object type tags (encrypted
    /// repositories).
    pub fn parse(name: &str, pack_id: PackId, bytes: &[u8], type_in_crc: bool) -> Result<Self> {
        let corrupt = |detail: String| CairnError::Corruption {
            name: name.to_string(),
            detail,
        };

        if bytes.len() < HEADER_SIZE + FANOUT_SIZE + FOOTER_SIZE {
            return Err(corrupt("idx too small".into()));
        }
        if bytes[..4] != IDX_MAGIC {
            return Err(corrupt("bad idx magic".into()));
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes"));
        if version != IDX_VERSION {
            return Err(corrupt(format!("unsupported idx version {version}")));
        }

        // The idx digest covers everything before it.
        let digest_start = bytes.len() - 20;
        let mut hasher = Sha1::new();
        hasher.update(&bytes[..digest_start]);
        let expected: [u8; 20] = hasher.finalize().into();
        if expected[..] != bytes[digest_start..] {
            return Err(corrupt("idx digest mismatch".into()));
        }

        let mut fanout = [0u32; 256];
        for (i, slot) in fanout.iter_mut().enumerate() {
            let at = HEADER_SIZE + i * 4;
            *slot = u32::from_be_bytes(bytes[at..at + 4].try_into().expect("4 bytes"));
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) {
            return Err(corrupt("idx fanout not monotonic".into()));
        }
        let n = fanout[255] as usize;

        let ids_start = HEADER_SIZE + FANOUT_SIZE;
        let crcs_start = ids_start + n * 20;
        let offsets_start = crcs_start + n * 4;
        let large_start = offsets_start + n * 4;
        let footer_start = bytes.len() - FOOTER_SIZE;
        if large_start > footer_start || (footer_start - large_start) % 8 != 0 {
            return Err(corrupt("idx size inconsistent with entry count".into()));
        }
        let large_count = (footer_start - large_start) / 8;

        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let at = ids_start + i * 20;
            let raw: [u8; 20] = bytes[at..at + 20].try_into().expect("20 bytes");
            ids.push(ObjectId(raw));
        }
        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(corrupt("idx IDs not strictly sorted".into()));
        }
        // Fanout must agree with the sorted ID array.
        for (byte, &count) in fanout.iter().enumerate() {
            let below = ids.partition_point(|id| id.first_byte() as usize <= byte);
            if below != count as usize {
                return Err(corrupt(format!("idx fanout inconsistent at byte {byte:#x}")));
            }
        }

        let mut crcs = Vec::with_capacity(n);
        for i in 0..n {
            let at = crcs_start + i * 4;
            crcs.push(u32::from_be_bytes(bytes[at..at + 4].try_into().expect("4 bytes")));
        }

        let mut offsets = Vec::with_capacity(n);
        for i in 0..n {
            let at = offsets_start + i * 4;
            let raw = u32::from_be_bytes(bytes[at..at + 4].try_into().expect("4 bytes"));
            if raw & LARGE_OFFSET_FLAG != 0 {
                let index = (raw & !LARGE_OFFSET_FLAG) as usize;
                if index >= large_count {
                    return Err(corrupt(format!(
                        "large-offset index {index} out of range ({large_count} entries)"
                    )));
                }
                let at = large_start + index * 8;
                offsets.push(u64::from_be_bytes(bytes[at..at + 8].try_into().expect("8 bytes")));
            } else {
                offsets.push(raw as u64);
            }
        }

        let pack_trailer: [u8; 20] = bytes[footer_start..footer_start + 20]
            .try_into()
            .expect("20 bytes");

        Ok(PackIdx {
            pack_id,
            name: name.to_string(),
            fanout,
            ids,
            crcs,
            offsets,
            pack_trailer,
            type_in_crc,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[ObjectId] {
        &self.ids
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.find(id).is_some()
    }

    /// Fanout-bounded binary search.
    pub fn find(&self, id: &ObjectId) -> Option<IdxEntry> {
        let byte = id.first_byte() as usize;
        let lo = if byte == 0 {
            0
        } else {
            self.fanout[byte - 1] as usize
        };
        let hi = self.fanout[byte] as usize;
        let slot = self.ids[lo..hi].binary_search(id).ok()? + lo;

        let crc = self.crcs[slot];
        let kind = if self.type_in_crc {
            ObjectKind::from_tag((crc >> 29) as u8).ok()
        } else {
            None
        };
        Some(IdxEntry {
            offset: self.offsets[slot],
            crc: if self.type_in_crc { crc & CRC_VALUE_MASK } else { crc },
            kind,
        })
    }
}
