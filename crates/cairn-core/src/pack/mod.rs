pub mod idx;
pub mod midx;

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::{ObjectId, ObjectKind};
use cairn_types::pack_id::PackId;

/// Magic bytes at the start of every pack file.
pub const PACK_MAGIC: &[u8; 4] = b"PACK";
/// Pack format version.
pub const PACK_VERSION: u32 = 2;
/// Size of the pack header (magic + version + object count).
pub const PACK_HEADER_SIZE: usize = 12;
/// Size of the trailing whole-pack digest.
pub const PACK_TRAILER_SIZE: usize = 20;
/// Size of a record's own header (type tag + compressed length).
pub const RECORD_HEADER_SIZE: usize = 5;

/// Ceiling on a single decompressed object. Guards object reads against
/// decompression bombs; the save path never produces anything close.
pub const MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024;

/// Which object stream a pack belongs to. With `bup.separatemeta`, file
/// data and tree/commit objects go to separate pack streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackKind {
    Data,
    Meta,
}

/// One object recorded while writing a pack: everything the idx needs.
#[derive(Debug, Clone, Copy)]
pub struct PackRecord {
    pub id: ObjectId,
    pub kind: ObjectKind,
    /// Stored CRC field: CRC-32 of the record bytes, with the object
    /// type folded into the high 3 bits when the repository is
    /// encrypted (restore from idx alone needs the types).
    pub crc: u32,
    pub offset: u64,
}

/// Result of sealing a pack: the finalized bytes plus the record table
/// (sorted by object ID) for idx generation.
pub struct SealedPack {
    pub pack_id: PackId,
    pub bytes: Vec<u8>,
    pub trailer: [u8; 20],
    pub records: Vec<PackRecord>,
}

/// Low 29 bits of the stored CRC field hold the truncated CRC when the
/// high bits carry a type tag.
pub const CRC_VALUE_MASK: u32 = 0x1FFF_FFFF;

fn fold_type_into_crc(crc: u32, kind: ObjectKind) -> u32 {
    ((kind.tag() as u32) << 29) | (crc & CRC_VALUE_MASK)
}

/// Map a configured zlib level to a flate2 setting; −1 selects zlib's
/// default level.
pub fn zlib_compression(level: i32) -> Compression {
    if level < 0 {
        Compression::default()
    } else {
        Compression::new(level.clamp(0, 9) as u32)
    }
}

pub fn zlib_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), zlib_compression(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(MAX_OBJECT_SIZE + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_OBJECT_SIZE {
        return Err(CairnError::InvalidFormat(format!(
            "object exceeds {MAX_OBJECT_SIZE}-byte decompression limit"
        )));
    }
    Ok(out)
}

/// Accumulates compressed object records for one pack file.
///
/// Records are buffered in memory and assembled by `seal()`; the
/// storage driver makes the final write atomic, so no reader ever
/// observes a partial pack under its canonical name.
pub struct PackWriter {
    pack_kind: PackKind,
    zlib_level: i32,
    size_limit: u64,
    type_in_crc: bool,
    body: Vec<u8>,
    records: Vec<PackRecord>,
    members: HashMap<ObjectId, usize>,
}

impl PackWriter {
    pub fn new(pack_kind: PackKind, zlib_level: i32, size_limit: u64, type_in_crc: bool) -> Self {
        PackWriter {
            pack_kind,
            zlib_level,
            size_limit,
            type_in_crc,
            body: Vec::new(),
            records: Vec::new(),
            members: HashMap::new(),
        }
    }

    pub fn pack_kind(&self) -> PackKind {
        self.pack_kind
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.records.len()
    }

    /// Current size of the pack as it would be finalized.
    pub fn current_size(&self) -> u64 {
        (PACK_HEADER_SIZE + self.body.len() + PACK_TRAILER_SIZE) as u64
    }

    /// Whether a new object belongs in a fresh pack. The limit is a
    /// soft ceiling checked before appending: the object that pushed a
    /// pack past it stays where it was written.
    pub fn should_rotate(&self) -> bool {
        !self.records.is_empty() && self.current_size() >= self.size_limit
    }

    /// Whether this writer holds the object in its not-yet-sealed pack.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.members.contains_key(id)
    }

    /// Append one object. The caller is responsible for duplicate
    /// suppression; appending an ID this writer already holds is a
    /// no-op.
    pub fn add(&mut self, id: ObjectId, kind: ObjectKind, payload: &[u8]) -> Result<u64> {
        if let Some(&index) = self.members.get(&id) {
            return Ok(self.records[index].offset);
        }

        let compressed = zlib_compress(payload, self.zlib_level)?;
        if compressed.len() > u32::MAX as usize {
            return Err(CairnError::InvalidFormat(
                "compressed object exceeds u32 length prefix".into(),
            ));
        }

        let offset = (PACK_HEADER_SIZE + self.body.len()) as u64;
        let record_start = self.body.len();
        self.body.push(kind.tag());
        self.body
            .extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        self.body.extend_from_slice(&compressed);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.body[record_start..]);
        let crc = hasher.finalize();
        let crc = if self.type_in_crc {
            fold_type_into_crc(crc, kind)
        } else {
            crc
        };

        self.members.insert(id, self.records.len());
        self.records.push(PackRecord {
            id,
            kind,
            crc,
            offset,
        });
        Ok(offset)
    }

    /// Assemble the finalized pack and clear this writer. The pack is
    /// named by the digest of its sorted member IDs, not upload order.
    pub fn seal(&mut self) -> Result<SealedPack> {
        if self.records.is_empty() {
            return Err(CairnError::Other("cannot seal an empty pack".into()));
        }

        let mut bytes =
            Vec::with_capacity(PACK_HEADER_SIZE + self.body.len() + PACK_TRAILER_SIZE);
        bytes.extend_from_slice(PACK_MAGIC);
        bytes.extend_from_slice(&PACK_VERSION.to_be_bytes());
        bytes.extend_from_slice(&(self.records.len() as u32).to_be_bytes());
        bytes.append(&mut self.body);

        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let trailer: [u8; 20] = hasher.finalize().into();
        bytes.extend_from_slice(&trailer);

        let ids: Vec<ObjectId> = self.records.iter().map(|r| r.id).collect();
        let pack_id = PackId::compute(&ids);

        let mut records = std::mem::take(&mut self.records);
        records.sort_by_key(|r| r.id);
        self.members.clear();

        Ok(SealedPack {
            pack_id,
            bytes,
            trailer,
            records,
        })
    }
}

/// A record parsed back out of a pack file.
pub struct ParsedRecord {
    pub kind: ObjectKind,
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Parse a record header (type tag + compressed length) from the first
/// `RECORD_HEADER_SIZE` bytes at a record offset.
pub fn parse_record_header(header: &[u8]) -> Result<(ObjectKind, u32)> {
    if header.len() < RECORD_HEADER_SIZE {
        return Err(CairnError::InvalidFormat("truncated pack record".into()));
    }
    let kind = ObjectKind::from_tag(header[0])?;
    let len = u32::from_be_bytes(header[1..5].try_into().expect("4 bytes"));
    Ok((kind, len))
}

/// Walk a whole pack, verifying the header and the trailing digest.
/// Returns every record in file order. Used by verification and tests;
/// the save path reads objects through the idx instead.
pub fn verify_pack(name: &str, bytes: &[u8]) -> Result<Vec<ParsedRecord>> {
    let corrupt = |detail: &str| CairnError::Corruption {
        name: name.to_string(),
        detail: detail.to_string(),
    };

    if bytes.len() < PACK_HEADER_SIZE + PACK_TRAILER_SIZE {
        return Err(corrupt("pack too small"));
    }
    if &bytes[..4] != PACK_MAGIC {
        return Err(corrupt("bad pack magic"));
    }
    let version = u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes"));
    if version != PACK_VERSION {
        return Err(corrupt(&format!("unsupported pack version {version}")));
    }
    let count = u32::from_be_bytes(bytes[8..12].try_into().expect("4 bytes")) as usize;

    let body_end = bytes.len() - PACK_TRAILER_SIZE;
    let mut hasher = Sha1::new();
    hasher.update(&bytes[..body_end]);
    let expected: [u8; 20] = hasher.finalize().into();
    if expected[..] != bytes[body_end..] {
        return Err(corrupt("pack trailer digest mismatch"));
    }

    let mut records = Vec::with_capacity(count);
    let mut pos = PACK_HEADER_SIZE;
    while pos < body_end {
        let (kind, len) = parse_record_header(&bytes[pos..body_end.min(pos + RECORD_HEADER_SIZE)])
            .map_err(|_| corrupt("truncated record header"))?;
        let data_start = pos + RECORD_HEADER_SIZE;
        let data_end = data_start + len as usize;
        if data_end > body_end {
            return Err(corrupt("record overruns pack body"));
        }
        let payload = zlib_decompress(&bytes[data_start..data_end])
            .map_err(|e| corrupt(&format!("record at {pos} does not inflate: {e}")))?;
        records.push(ParsedRecord {
            kind,
            offset: pos as u64,
            payload,
        });
        pos = data_end;
    }
    if records.len() != count {
        return Err(corrupt(&format!(
            "object count mismatch: header says {count}, found {}",
            records.len()
        )));
    }
    Ok(records)
}
