use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use cairn_types::error::{CairnError, Result};

use super::{ClassHint, StorageDriver};

/// Storage driver for a local filesystem directory.
///
/// Finalized objects are written to a temporary file in the target
/// directory, fsynced, and renamed into place, so readers only ever see
/// complete files under canonical names.
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: &Path) -> Result<Self> {
        let root = if root.exists() {
            fs::canonicalize(root)?
        } else {
            root.to_path_buf()
        };
        Ok(LocalDriver { root })
    }

    /// Reject names that could escape the repository root.
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CairnError::InvalidFormat("unsafe storage name: empty".into()));
        }
        if name.starts_with('/') || name.contains('\\') {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe storage name '{name}'"
            )));
        }
        for component in Path::new(name).components() {
            if component == Component::ParentDir {
                return Err(CairnError::InvalidFormat(format!(
                    "unsafe storage name: parent traversal in '{name}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn list_recursive(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let name = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(name);
                }
            }
        }
        Ok(())
    }

    /// Write `data` to a temp file in `target`'s directory, fsync, and
    /// rename over `target`.
    fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| CairnError::InvalidFormat("storage name has no parent".into()))?;
        fs::create_dir_all(parent)?;

        let tmp_name = format!(
            ".tmp-{:08x}-{}",
            rand::random::<u32>(),
            std::process::id()
        );
        let tmp_path = parent.join(tmp_name);
        let mut file = fs::File::create(&tmp_path)?;
        if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        drop(file);
        if let Err(e) = fs::rename(&tmp_path, target) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        // Persist the rename itself.
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

/// Removes the CAS lock file when the guard goes out of scope.
struct LockGuard(PathBuf);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

impl StorageDriver for LocalDriver {
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Self::validate_name(prefix.trim_end_matches('/'))?;
        let dir = self.root.join(prefix.trim_end_matches('/'));
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut names = Vec::new();
                self.list_recursive(&dir, &mut names)?;
                names.retain(|n| n.starts_with(prefix.trim_end_matches('/')));
                names.sort();
                Ok(names)
            }
            Ok(_) => Ok(vec![prefix.trim_end_matches('/').to_string()]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match range {
            None => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(Some(data))
            }
            Some((offset, length)) => {
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; length as usize];
                let mut filled = 0;
                while filled < buf.len() {
                    match file.read(&mut buf[filled..]) {
                        Ok(0) => {
                            return Err(CairnError::StorageFatal(format!(
                                "short read from '{name}': wanted {length} bytes at {offset}, got {filled}"
                            )))
                        }
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(Some(buf))
            }
        }
    }

    fn write(&self, name: &str, data: &[u8], _class: ClassHint) -> Result<()> {
        let path = self.resolve(name)?;
        // Put-if-absent: finalized names are content-addressed, so an
        // existing file already holds these bytes.
        if path.is_file() {
            return Ok(());
        }
        self.write_atomic(&path, data)
    }

    fn cas_ref(&self, name: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Appended, not substituted: `main` and `main.x` must not share
        // a lock file.
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let _guard = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => LockGuard(lock_path),
            // Another writer holds the lock; report a lost race and let
            // the caller re-read and retry.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let current = match fs::read(&path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.write_atomic(&path, new)?;
        Ok(true)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(dir.path()).unwrap();
        (dir, driver)
    }

    #[test]
    fn validate_name_rejects_escapes() {
        assert!(LocalDriver::validate_name("/etc/passwd").is_err());
        assert!(LocalDriver::validate_name("../outside").is_err());
        assert!(LocalDriver::validate_name("a/../../b").is_err());
        assert!(LocalDriver::validate_name("a\\b").is_err());
        assert!(LocalDriver::validate_name("").is_err());
        assert!(LocalDriver::validate_name("objects/pack/pack-ab.pack").is_ok());
    }

    #[test]
    fn read_missing_returns_none() {
        let (_dir, driver) = driver();
        assert!(driver.read("nope", None).unwrap().is_none());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, driver) = driver();
        driver
            .write("objects/pack/x", b"hello world", ClassHint::DataSmall)
            .unwrap();
        assert_eq!(
            driver.read("objects/pack/x", None).unwrap().unwrap(),
            b"hello world"
        );
        assert_eq!(
            driver.read("objects/pack/x", Some((6, 5))).unwrap().unwrap(),
            b"world"
        );
    }

    #[test]
    fn short_range_read_is_an_error() {
        let (_dir, driver) = driver();
        driver.write("x", b"abc", ClassHint::MetaSmall).unwrap();
        assert!(driver.read("x", Some((0, 10))).is_err());
    }

    #[test]
    fn write_is_put_if_absent() {
        let (_dir, driver) = driver();
        driver.write("x", b"first", ClassHint::MetaSmall).unwrap();
        driver.write("x", b"second", ClassHint::MetaSmall).unwrap();
        assert_eq!(driver.read("x", None).unwrap().unwrap(), b"first");
    }

    #[test]
    fn list_prefix_returns_sorted_names() {
        let (_dir, driver) = driver();
        driver
            .write("objects/pack/b.idx", b"b", ClassHint::IdxSmall)
            .unwrap();
        driver
            .write("objects/pack/a.idx", b"a", ClassHint::IdxSmall)
            .unwrap();
        let names = driver.list_prefix("objects/pack/").unwrap();
        assert_eq!(names, vec!["objects/pack/a.idx", "objects/pack/b.idx"]);
    }

    #[test]
    fn cas_ref_basic_flow() {
        let (_dir, driver) = driver();
        // Create from nothing.
        assert!(driver.cas_ref("refs/heads/main", None, b"one").unwrap());
        // Wrong expectation fails.
        assert!(!driver.cas_ref("refs/heads/main", None, b"two").unwrap());
        assert!(!driver
            .cas_ref("refs/heads/main", Some(b"stale"), b"two")
            .unwrap());
        // Correct expectation succeeds.
        assert!(driver
            .cas_ref("refs/heads/main", Some(b"one"), b"two")
            .unwrap());
        assert_eq!(
            driver.read("refs/heads/main", None).unwrap().unwrap(),
            b"two"
        );
    }

    #[test]
    fn cas_ref_respects_existing_lock() {
        let (dir, driver) = driver();
        fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        fs::write(dir.path().join("refs/heads/main.lock"), b"").unwrap();
        assert!(!driver.cas_ref("refs/heads/main", None, b"x").unwrap());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, driver) = driver();
        driver.write("x", b"abc", ClassHint::MetaSmall).unwrap();
        driver.delete("x").unwrap();
        driver.delete("x").unwrap();
        assert!(driver.read("x", None).unwrap().is_none());
    }
}
