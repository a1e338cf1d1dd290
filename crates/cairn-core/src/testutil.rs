use std::collections::HashMap;
use std::sync::Mutex;

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::{ObjectId, ObjectKind};

use crate::split::RecordSplitter;
use crate::storage::{ClassHint, StorageDriver};
use crate::store::ObjectSink;

/// In-memory storage driver for tests. Thread-safe via a single Mutex,
/// which also makes `cas_ref` trivially atomic.
pub struct MemoryDriver {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver {
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Total stored bytes across all names (for dedup assertions).
    pub fn total_bytes(&self) -> usize {
        self.data.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Overwrite a name unconditionally (to inject corruption).
    pub fn clobber(&self, name: &str, data: Vec<u8>) {
        self.data.lock().unwrap().insert(name.to_string(), data);
    }
}

impl StorageDriver for MemoryDriver {
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        let mut names: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        let Some(data) = map.get(name) else {
            return Ok(None);
        };
        match range {
            None => Ok(Some(data.clone())),
            Some((offset, length)) => {
                let end = offset + length;
                if end > data.len() as u64 {
                    return Err(CairnError::StorageFatal(format!(
                        "short read from '{name}': wanted {length} bytes at {offset}"
                    )));
                }
                Ok(Some(data[offset as usize..end as usize].to_vec()))
            }
        }
    }

    fn write(&self, name: &str, data: &[u8], _class: ClassHint) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.entry(name.to_string()).or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn cas_ref(&self, name: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let mut map = self.data.lock().unwrap();
        if map.get(name).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        map.insert(name.to_string(), new.to_vec());
        Ok(true)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.data.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Object sink that keeps everything in a HashMap; lets tree tests walk
/// what they wrote without a repository.
pub struct MemSink {
    objects: HashMap<ObjectId, (ObjectKind, Vec<u8>)>,
}

impl MemSink {
    pub fn new() -> Self {
        MemSink {
            objects: HashMap::new(),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<(ObjectKind, Vec<u8>)> {
        self.objects.get(id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &(ObjectKind, Vec<u8>))> {
        self.objects.iter()
    }
}

impl ObjectSink for MemSink {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::for_object(kind, payload);
        self.objects.insert(id, (kind, payload.to_vec()));
        Ok(id)
    }
}

/// Deterministic record splitter closing a group after every N records;
/// the injected stand-in for the rolling-hash splitter in tree tests.
pub struct SplitEveryN {
    every: usize,
    fed: usize,
}

impl SplitEveryN {
    pub fn new(every: usize) -> Self {
        SplitEveryN { every, fed: 0 }
    }
}

impl RecordSplitter for SplitEveryN {
    fn feed(&mut self, _record: &[u8]) -> Option<u32> {
        self.fed += 1;
        if self.every != usize::MAX && self.fed % self.every == 0 {
            Some(1)
        } else {
            None
        }
    }
}
