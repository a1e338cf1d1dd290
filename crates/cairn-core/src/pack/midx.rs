use sha1::{Digest, Sha1};

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::ObjectId;

use super::idx::PackIdx;

pub const MIDX_MAGIC: &[u8; 4] = b"MIDX";
pub const MIDX_VERSION: u32 = 1;

/// Bits reserved per entry; at k = 5 hashes this yields a false
/// positive rate under 1%.
const BLOOM_BITS_PER_ENTRY: usize = 10;

/// Split-membership filter keyed by the five disjoint 32-bit words of
/// an object ID. No rehashing: the ID is already uniformly distributed,
/// so each word serves directly as one probe position.
pub struct BloomFilter {
    bits: Vec<u8>,
    /// Bit-position mask; the filter size is a power of two.
    mask: u32,
}

impl BloomFilter {
    /// Filter sized for `n` entries at 10 bits per entry, rounded up to
    /// a power of two so probes reduce to a mask.
    pub fn with_capacity(n: usize) -> Self {
        let bits = (n.max(1) * BLOOM_BITS_PER_ENTRY).next_power_of_two().max(64);
        BloomFilter {
            bits: vec![0u8; bits / 8],
            mask: (bits - 1) as u32,
        }
    }

    fn from_bits(bits: Vec<u8>) -> Result<Self> {
        let nbits = bits.len() * 8;
        if !nbits.is_power_of_two() || nbits < 64 {
            return Err(CairnError::InvalidFormat(format!(
                "bloom filter size {nbits} bits is not a power of two"
            )));
        }
        Ok(BloomFilter {
            bits,
            mask: (nbits - 1) as u32,
        })
    }

    fn probes(id: &ObjectId) -> [u32; 5] {
        let raw = id.as_bytes();
        let mut out = [0u32; 5];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().expect("4 bytes"));
        }
        out
    }

    pub fn insert(&mut self, id: &ObjectId) {
        for probe in Self::probes(id) {
            let bit = probe & self.mask;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// `false` is definitive; `true` may be a false positive.
    pub fn contains(&self, id: &ObjectId) -> bool {
        Self::probes(id).iter().all(|probe| {
            let bit = probe & self.mask;
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }
}

/// Union index over many idxes: one sorted ID array with a fanout, a
/// per-ID ordinal naming the covering idx, and a Bloom filter so misses
/// cost no binary search at all.
pub struct Midx {
    pub name: String,
    covered: Vec<String>,
    fanout: [u32; 256],
    ids: Vec<ObjectId>,
    which: Vec<u32>,
    bloom: BloomFilter,
}

impl Midx {
    /// Merge the given idxes into encoded midx bytes plus the storage
    /// name (derived from the content digest).
    pub fn build(idxes: &[&PackIdx]) -> (String, Vec<u8>) {
        // k-way merge of already-sorted ID arrays.
        let mut merged: Vec<(ObjectId, u32)> = Vec::with_capacity(
            idxes.iter().map(|idx| idx.len()).sum(),
        );
        for (ordinal, idx) in idxes.iter().enumerate() {
            for id in idx.ids() {
                merged.push((*id, ordinal as u32));
            }
        }
        merged.sort_by_key(|(id, _)| *id);
        // An object appears in at most one pack; if a duplicate ever
        // slips in, keep the first covering idx.
        merged.dedup_by_key(|(id, _)| *id);

        let mut bloom = BloomFilter::with_capacity(merged.len());
        let mut fanout = [0u32; 256];
        for (id, _) in &merged {
            bloom.insert(id);
            fanout[id.first_byte() as usize] += 1;
        }
        let mut running = 0u32;
        for slot in fanout.iter_mut() {
            running += *slot;
            *slot = running;
        }

        let mut out = Vec::new();
        out.extend_from_slice(MIDX_MAGIC);
        out.extend_from_slice(&MIDX_VERSION.to_be_bytes());
        out.extend_from_slice(&(idxes.len() as u32).to_be_bytes());
        out.extend_from_slice(&(merged.len() as u32).to_be_bytes());
        out.extend_from_slice(&(bloom.bits.len() as u32).to_be_bytes());
        for idx in idxes {
            let name = idx.name.as_bytes();
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name);
        }
        for count in fanout {
            out.extend_from_slice(&count.to_be_bytes());
        }
        for (id, _) in &merged {
            out.extend_from_slice(id.as_bytes());
        }
        for (_, ordinal) in &merged {
            out.extend_from_slice(&ordinal.to_be_bytes());
        }
        out.extend_from_slice(&bloom.bits);

        let mut hasher = Sha1::new();
        hasher.update(&out);
        let digest: [u8; 20] = hasher.finalize().into();
        out.extend_from_slice(&digest);

        let name = format!("objects/pack/midx-{}.midx", hex::encode(digest));
        (name, out)
    }

    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: String| CairnError::Corruption {
            name: name.to_string(),
            detail,
        };

        if bytes.len() < 20 + 20 {
            return Err(corrupt("midx too small".into()));
        }
        let digest_start = bytes.len() - 20;
        let mut hasher = Sha1::new();
        hasher.update(&bytes[..digest_start]);
        let expected: [u8; 20] = hasher.finalize().into();
        if expected[..] != bytes[digest_start..] {
            return Err(corrupt("midx digest mismatch".into()));
        }

        if &bytes[..4] != MIDX_MAGIC {
            return Err(corrupt("bad midx magic".into()));
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes"));
        if version != MIDX_VERSION {
            return Err(corrupt(format!("unsupported midx version {version}")));
        }
        let idx_count = u32::from_be_bytes(bytes[8..12].try_into().expect("4 bytes")) as usize;
        let id_count = u32::from_be_bytes(bytes[12..16].try_into().expect("4 bytes")) as usize;
        let bloom_len = u32::from_be_bytes(bytes[16..20].try_into().expect("4 bytes")) as usize;

        let mut pos = 20;
        let mut covered = Vec::with_capacity(idx_count);
        for _ in 0..idx_count {
            if pos + 2 > digest_start {
                return Err(corrupt("truncated idx name table".into()));
            }
            let len =
                u16::from_be_bytes(bytes[pos..pos + 2].try_into().expect("2 bytes")) as usize;
            pos += 2;
            if pos + len > digest_start {
                return Err(corrupt("truncated idx name".into()));
            }
            let name = std::str::from_utf8(&bytes[pos..pos + len])
                .map_err(|_| corrupt("idx name is not UTF-8".into()))?;
            covered.push(name.to_string());
            pos += len;
        }

        let need = 256 * 4 + id_count * 20 + id_count * 4 + bloom_len;
        if digest_start - pos != need {
            return Err(corrupt("midx size inconsistent with counts".into()));
        }

        let mut fanout = [0u32; 256];
        for slot in fanout.iter_mut() {
            *slot = u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
            pos += 4;
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) || fanout[255] as usize != id_count {
            return Err(corrupt("midx fanout not monotonic".into()));
        }

        let mut ids = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            let raw: [u8; 20] = bytes[pos..pos + 20].try_into().expect("20 bytes");
            ids.push(ObjectId(raw));
            pos += 20;
        }
        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(corrupt("midx IDs not strictly sorted".into()));
        }

        let mut which = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            let ordinal = u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
            if ordinal as usize >= idx_count {
                return Err(corrupt(format!("midx ordinal {ordinal} out of range")));
            }
            which.push(ordinal);
            pos += 4;
        }

        let bloom = BloomFilter::from_bits(bytes[pos..pos + bloom_len].to_vec())?;

        Ok(Midx {
            name: name.to_string(),
            covered,
            fanout,
            ids,
            which,
            bloom,
        })
    }

    /// Storage names of the idxes this midx claims to cover.
    pub fn covered(&self) -> &[String] {
        &self.covered
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resolve an ID to the name of the idx holding it. The Bloom
    /// filter answers most absent IDs without touching the ID array.
    pub fn lookup(&self, id: &ObjectId) -> Option<&str> {
        if !self.bloom.contains(id) {
            return None;
        }
        let byte = id.first_byte() as usize;
        let lo = if byte == 0 {
            0
        } else {
            self.fanout[byte - 1] as usize
        };
        let hi = self.fanout[byte] as usize;
        let slot = self.ids[lo..hi].binary_search(id).ok()? + lo;
        Some(&self.covered[self.which[slot] as usize])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lookup(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::idx::encode_idx;
    use crate::pack::{PackKind, PackWriter};
    use cairn_types::oid::ObjectKind;
    use cairn_types::pack_id::PackId;

    fn make_idx(name: &str, tag: u8, payloads: usize) -> PackIdx {
        let mut writer = PackWriter::new(PackKind::Data, 1, u64::MAX, false);
        for i in 0..payloads {
            let payload = format!("{name}-{tag}-{i}").into_bytes();
            let id = ObjectId::for_object(ObjectKind::Blob, &payload);
            writer.add(id, ObjectKind::Blob, &payload).unwrap();
        }
        let sealed = writer.seal().unwrap();
        let bytes = encode_idx(&sealed.records, &sealed.trailer);
        PackIdx::parse(name, PackId([tag; 20]), &bytes, false).unwrap()
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let ids: Vec<ObjectId> = (0..5000u32)
            .map(|i| ObjectId::for_object(ObjectKind::Blob, &i.to_le_bytes()))
            .collect();
        let mut bloom = BloomFilter::with_capacity(ids.len());
        for id in &ids {
            bloom.insert(id);
        }
        for id in &ids {
            assert!(bloom.contains(id));
        }
    }

    #[test]
    fn bloom_false_positive_rate_is_low() {
        let mut bloom = BloomFilter::with_capacity(10_000);
        for i in 0..10_000u32 {
            bloom.insert(&ObjectId::for_object(ObjectKind::Blob, &i.to_le_bytes()));
        }
        let false_positives = (0..10_000u32)
            .map(|i| ObjectId::for_object(ObjectKind::Tree, &i.to_le_bytes()))
            .filter(|id| bloom.contains(id))
            .count();
        // Target is <1%; allow slack for the power-of-two rounding.
        assert!(
            false_positives < 200,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn build_parse_lookup_roundtrip() {
        let a = make_idx("objects/pack/pack-aa.idx", 0xaa, 200);
        let b = make_idx("objects/pack/pack-bb.idx", 0xbb, 300);
        let (name, bytes) = Midx::build(&[&a, &b]);
        let midx = Midx::parse(&name, &bytes).unwrap();

        assert_eq!(midx.len(), 500);
        assert_eq!(midx.covered().len(), 2);
        for id in a.ids() {
            assert_eq!(midx.lookup(id), Some("objects/pack/pack-aa.idx"));
        }
        for id in b.ids() {
            assert_eq!(midx.lookup(id), Some("objects/pack/pack-bb.idx"));
        }
        let absent = ObjectId::for_object(ObjectKind::Blob, b"definitely absent");
        assert!(!midx.contains(&absent));
    }

    #[test]
    fn tampered_midx_is_corruption() {
        let a = make_idx("objects/pack/pack-cc.idx", 0xcc, 50);
        let (name, mut bytes) = Midx::build(&[&a]);
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x80;
        let err = Midx::parse(&name, &bytes).unwrap_err();
        assert!(matches!(err, CairnError::Corruption { .. }), "got {err:?}");
    }

    #[test]
    fn midx_name_is_content_derived() {
        let a = make_idx("objects/pack/pack-dd.idx", 0xdd, 10);
        let (name1, _) = Midx::build(&[&a]);
        let (name2, _) = Midx::build(&[&a]);
        assert_eq!(name1, name2);
        assert!(name1.starts_with("objects/pack/midx-"));
        assert!(name1.ends_with(".midx"));
    }
}
