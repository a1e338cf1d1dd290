use std::sync::Arc;

use tracing::{debug, warn};

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::{ObjectId, ObjectKind};
use cairn_types::pack_id::PackId;

use crate::config::Settings;
use crate::pack::idx::{encode_idx, PackIdx};
use crate::pack::midx::Midx;
use crate::pack::{parse_record_header, zlib_decompress, PackKind, PackWriter, RECORD_HEADER_SIZE};
use crate::storage::{ClassHint, StorageDriver};

/// Build a midx once this many idxes have accumulated.
pub const MIDX_MIN_IDXES: usize = 16;

/// Where object writers send their output. The tree builders depend on
/// this seam only, so tests can capture objects in memory.
pub trait ObjectSink {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId>;

    /// Like `write_object`, but routes blobs to the metadata pack
    /// stream when the repository separates data from metadata.
    fn write_meta_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        self.write_object(kind, payload)
    }
}

impl<T: ObjectSink + ?Sized> ObjectSink for &mut T {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        (**self).write_object(kind, payload)
    }

    fn write_meta_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        (**self).write_meta_object(kind, payload)
    }
}

/// Adapter that pins every write to the metadata stream; used for
/// `.bupm` companion blobs.
pub struct MetaStream<'a, S: ObjectSink + ?Sized>(pub &'a mut S);

impl<S: ObjectSink + ?Sized> ObjectSink for MetaStream<'_, S> {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        self.0.write_meta_object(kind, payload)
    }
}

/// The object store facade: total dedup in front of one or two pack
/// writers, with midx/idx lookup behind an `exists` that never reports
/// a false negative.
pub struct PackStore {
    driver: Arc<dyn StorageDriver>,
    separatemeta: bool,
    type_in_crc: bool,
    idxes: Vec<PackIdx>,
    midxes: Vec<Midx>,
    /// Idx names covered by a loaded midx (skipped on direct probes).
    covered: std::collections::HashSet<String>,
    data: PackWriter,
    meta: PackWriter,
    session_packs: Vec<PackId>,
}

fn pack_id_from_name(name: &str) -> Option<PackId> {
    let base = name.rsplit('/').next()?;
    let hex = base.strip_prefix("pack-")?.split('.').next()?;
    let raw = hex::decode(hex).ok()?;
    raw.try_into().ok().map(PackId)
}

fn idx_cache_path(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    dir.join(name.replace('/', "_"))
}

fn read_idx_cache(dir: &std::path::Path, name: &str) -> Option<Vec<u8>> {
    std::fs::read(idx_cache_path(dir, name)).ok()
}

/// Best-effort: a failed cache write only costs the next open a
/// refetch.
fn write_idx_cache(dir: &std::path::Path, name: &str, bytes: &[u8]) {
    if let Err(e) = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(idx_cache_path(dir, name), bytes))
    {
        debug!("failed to write idx cache for '{name}': {e}");
    }
}

fn drop_idx_cache(dir: &std::path::Path, name: &str) {
    let _ = std::fs::remove_file(idx_cache_path(dir, name));
}

impl PackStore {
    /// Load every idx and midx under `objects/pack/`. Corrupt files are
    /// quarantined (renamed aside) and skipped; a midx covering a
    /// missing idx is stale and ignored.
    pub fn open(
        driver: Arc<dyn StorageDriver>,
        settings: &Settings,
        encrypted: bool,
    ) -> Result<Self> {
        let zlib_level = settings.zlib_level(encrypted);
        let mut store = PackStore {
            driver,
            separatemeta: settings.separatemeta,
            type_in_crc: encrypted,
            idxes: Vec::new(),
            midxes: Vec::new(),
            covered: std::collections::HashSet::new(),
            data: PackWriter::new(PackKind::Data, zlib_level, settings.pack_size_limit, encrypted),
            meta: PackWriter::new(PackKind::Meta, zlib_level, settings.pack_size_limit, encrypted),
            session_packs: Vec::new(),
        };

        // Local idx cache (`bup.cachedir`): decrypted idx bytes are
        // kept on local disk so reopening an encrypted repository does
        // not re-download and re-decrypt every index.
        let cache_dir = if encrypted {
            settings.cachedir.clone()
        } else {
            None
        };

        let names = store.driver.list_prefix("objects/pack/")?;
        for name in names.iter().filter(|n| n.ends_with(".idx")) {
            let Some(pack_id) = pack_id_from_name(name) else {
                warn!("skipping unrecognized idx name '{name}'");
                continue;
            };

            if let Some(dir) = &cache_dir {
                if let Some(bytes) = read_idx_cache(dir, name) {
                    match PackIdx::parse(name, pack_id, &bytes, encrypted) {
                        Ok(idx) => {
                            store.idxes.push(idx);
                            continue;
                        }
                        Err(e) => {
                            // Corrupt cache entry: discard and fall
                            // through to the driver copy.
                            warn!("idx cache for '{name}' invalid ({e}); refetching");
                            drop_idx_cache(dir, name);
                        }
                    }
                }
            }

            let Some(bytes) = store.driver.read(name, None)? else {
                continue;
            };
            match PackIdx::parse(name, pack_id, &bytes, encrypted) {
                Ok(idx) => {
                    if let Some(dir) = &cache_dir {
                        write_idx_cache(dir, name, &bytes);
                    }
                    store.idxes.push(idx);
                }
                Err(e @ CairnError::Corruption { .. }) => {
                    warn!("{e}; quarantining");
                    store.quarantine(name, &bytes)?;
                }
                Err(e) => return Err(e),
            }
        }

        let idx_names: std::collections::HashSet<&str> =
            store.idxes.iter().map(|i| i.name.as_str()).collect();
        for name in names.iter().filter(|n| n.ends_with(".midx")) {
            let Some(bytes) = store.driver.read(name, None)? else {
                continue;
            };
            match Midx::parse(name, &bytes) {
                Ok(midx) => {
                    if midx
                        .covered()
                        .iter()
                        .all(|idx| idx_names.contains(idx.as_str()))
                    {
                        store.covered.extend(midx.covered().iter().cloned());
                        store.midxes.push(midx);
                    } else {
                        debug!("ignoring stale midx '{name}'");
                    }
                }
                Err(e @ CairnError::Corruption { .. }) => {
                    warn!("{e}; quarantining");
                    store.quarantine(name, &bytes)?;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            idxes = store.idxes.len(),
            midxes = store.midxes.len(),
            "opened pack store"
        );
        Ok(store)
    }

    /// Rename a failed-validation file aside so the repository keeps
    /// operating on the remaining files.
    fn quarantine(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let aside = format!("{name}.quarantine");
        self.driver
            .write(&aside, bytes, ClassHint::idx(bytes.len() as u64))?;
        self.driver.delete(name)?;
        Ok(())
    }

    /// Number of loaded idxes (one per finalized pack).
    pub fn idx_count(&self) -> usize {
        self.idxes.len()
    }

    /// Whether the object is already stored or pending. No false
    /// negatives: Bloom hits fall through to a real lookup.
    pub fn exists(&self, id: &ObjectId) -> bool {
        if self.data.contains(id) || self.meta.contains(id) {
            return true;
        }
        if self.midxes.iter().any(|m| m.contains(id)) {
            return true;
        }
        self.idxes
            .iter()
            .any(|idx| !self.covered.contains(&idx.name) && idx.contains(id))
    }

    /// Write an object unless it already exists. Returns the ID and
    /// whether new bytes entered the repository.
    pub fn write(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<(ObjectId, bool)> {
        self.write_routed(kind, payload, false)
    }

    fn write_routed(
        &mut self,
        kind: ObjectKind,
        payload: &[u8],
        force_meta: bool,
    ) -> Result<(ObjectId, bool)> {
        let id = ObjectId::for_object(kind, payload);
        if self.exists(&id) {
            return Ok((id, false));
        }

        let pack_kind = if self.separatemeta && (force_meta || kind != ObjectKind::Blob) {
            PackKind::Meta
        } else {
            PackKind::Data
        };
        // Soft size cap, enforced before appending: the object that
        // pushed a pack past the limit stays in it.
        if self.writer(pack_kind).should_rotate() {
            self.seal_writer(pack_kind)?;
        }
        self.writer(pack_kind).add(id, kind, payload)?;
        Ok((id, true))
    }

    fn writer(&mut self, pack_kind: PackKind) -> &mut PackWriter {
        match pack_kind {
            PackKind::Data => &mut self.data,
            PackKind::Meta => &mut self.meta,
        }
    }

    /// Seal one writer's pack and publish `.pack` + `.idx` through the
    /// driver (idx second, so an idx never names a missing pack).
    fn seal_writer(&mut self, pack_kind: PackKind) -> Result<()> {
        if self.writer(pack_kind).is_empty() {
            return Ok(());
        }
        let sealed = self.writer(pack_kind).seal()?;
        let pack_name = sealed.pack_id.pack_name();
        let idx_name = sealed.pack_id.idx_name();
        let idx_bytes = encode_idx(&sealed.records, &sealed.trailer);

        let pack_hint = match pack_kind {
            PackKind::Data => ClassHint::data(sealed.bytes.len() as u64),
            PackKind::Meta => ClassHint::meta(sealed.bytes.len() as u64),
        };
        self.driver.write(&pack_name, &sealed.bytes, pack_hint)?;
        self.driver
            .write(&idx_name, &idx_bytes, ClassHint::idx(idx_bytes.len() as u64))?;

        debug!(
            pack = %sealed.pack_id,
            objects = sealed.records.len(),
            bytes = sealed.bytes.len(),
            "finalized pack"
        );

        if !self.idxes.iter().any(|i| i.name == idx_name) {
            let idx = PackIdx::parse(&idx_name, sealed.pack_id, &idx_bytes, self.type_in_crc)?;
            self.idxes.push(idx);
        }
        self.session_packs.push(sealed.pack_id);
        Ok(())
    }

    /// Close all in-progress packs and opportunistically rebuild the
    /// midx. Returns the packs finalized during this session.
    pub fn finish(&mut self) -> Result<Vec<PackId>> {
        self.seal_writer(PackKind::Data)?;
        self.seal_writer(PackKind::Meta)?;
        self.maybe_build_midx()?;
        Ok(std::mem::take(&mut self.session_packs))
    }

    fn maybe_build_midx(&mut self) -> Result<()> {
        let uncovered = self
            .idxes
            .iter()
            .filter(|idx| !self.covered.contains(&idx.name))
            .count();
        if self.idxes.len() < MIDX_MIN_IDXES || uncovered == 0 {
            return Ok(());
        }

        let refs: Vec<&PackIdx> = self.idxes.iter().collect();
        let (name, bytes) = Midx::build(&refs);
        self.driver
            .write(&name, &bytes, ClassHint::idx(bytes.len() as u64))?;
        let midx = Midx::parse(&name, &bytes)?;
        debug!(
            midx = %name,
            ids = midx.len(),
            idxes = self.idxes.len(),
            "built multi-pack index"
        );
        self.covered.extend(midx.covered().iter().cloned());
        self.midxes.push(midx);
        Ok(())
    }

    fn locate(&self, id: &ObjectId) -> Option<(&PackIdx, crate::pack::idx::IdxEntry)> {
        for midx in &self.midxes {
            if let Some(idx_name) = midx.lookup(id) {
                if let Some(idx) = self.idxes.iter().find(|i| i.name == idx_name) {
                    if let Some(entry) = idx.find(id) {
                        return Some((idx, entry));
                    }
                }
            }
        }
        self.idxes
            .iter()
            .find_map(|idx| idx.find(id).map(|entry| (idx, entry)))
    }

    /// Read one object back through its idx entry (two ranged reads:
    /// record header, then the compressed payload).
    pub fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        let (idx, entry) = self
            .locate(id)
            .ok_or_else(|| CairnError::Other(format!("object not found: {id}")))?;
        let pack_name = idx.pack_id.pack_name();

        let header = self
            .driver
            .read(&pack_name, Some((entry.offset, RECORD_HEADER_SIZE as u64)))?
            .ok_or_else(|| CairnError::Corruption {
                name: pack_name.clone(),
                detail: format!("pack missing for idx '{}'", idx.name),
            })?;
        let (kind, len) = parse_record_header(&header)?;
        let compressed = self
            .driver
            .read(
                &pack_name,
                Some((entry.offset + RECORD_HEADER_SIZE as u64, len as u64)),
            )?
            .ok_or_else(|| CairnError::Corruption {
                name: pack_name.clone(),
                detail: "pack vanished mid-read".into(),
            })?;
        let payload = zlib_decompress(&compressed)?;

        if ObjectId::for_object(kind, &payload) != *id {
            return Err(CairnError::Corruption {
                name: pack_name,
                detail: format!("object {id} does not hash to its ID"),
            });
        }
        Ok((kind, payload))
    }
}

impl ObjectSink for PackStore {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        Ok(self.write_routed(kind, payload, false)?.0)
    }

    fn write_meta_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        Ok(self.write_routed(kind, payload, true)?.0)
    }
}
