use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::ObjectId;

use crate::crypto::SecretCipher;
use crate::storage::StorageDriver;

const REFS_AAD: &[u8] = b"refs";

/// Named pointers from branches to commits, updated by compare-and-set.
///
/// Plain repositories keep one file per branch under `refs/heads/`.
/// Encrypted repositories keep a single encrypted name→ID map under a
/// configurable `refsname`, so concurrent writers can be pointed at
/// disjoint ref files and never contend on the CAS.
pub enum RefStore {
    Plain {
        driver: Arc<dyn StorageDriver>,
    },
    Encrypted {
        driver: Arc<dyn StorageDriver>,
        cipher: SecretCipher,
        refsname: String,
    },
}

fn validate_branch(branch: &str) -> Result<()> {
    let ok = !branch.is_empty()
        && !branch.starts_with(['/', '.', '-'])
        && !branch.ends_with('/')
        && !branch.contains("..")
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(CairnError::Config(format!("invalid branch name '{branch}'")))
    }
}

fn branch_file(branch: &str) -> Result<String> {
    validate_branch(branch)?;
    Ok(format!("refs/heads/{branch}"))
}

impl RefStore {
    pub fn plain(driver: Arc<dyn StorageDriver>) -> Self {
        RefStore::Plain { driver }
    }

    pub fn encrypted(driver: Arc<dyn StorageDriver>, repokey: &[u8; 32], refsname: &str) -> Self {
        RefStore::Encrypted {
            driver,
            cipher: SecretCipher::new(repokey),
            refsname: format!("refs/{refsname}"),
        }
    }

    pub fn read_ref(&self, branch: &str) -> Result<Option<ObjectId>> {
        match self {
            RefStore::Plain { driver } => {
                let Some(raw) = driver.read(&branch_file(branch)?, None)? else {
                    return Ok(None);
                };
                let text = std::str::from_utf8(&raw)
                    .map_err(|_| CairnError::InvalidFormat("ref file is not UTF-8".into()))?;
                Ok(Some(ObjectId::from_hex(text)?))
            }
            RefStore::Encrypted { .. } => {
                validate_branch(branch)?;
                let (_, map) = self.load_map()?;
                Ok(map.get(branch).copied())
            }
        }
    }

    /// Atomically move a branch from `expected` to `new`. `false` means
    /// the branch tip moved underneath us (or another writer holds the
    /// update lock); the caller re-reads and retries.
    pub fn update_ref(
        &self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool> {
        match self {
            RefStore::Plain { driver } => {
                let file = branch_file(branch)?;
                let new_bytes = format!("{}\n", new.to_hex()).into_bytes();
                let expected_bytes = expected.map(|id| format!("{}\n", id.to_hex()).into_bytes());
                driver.cas_ref(&file, expected_bytes.as_deref(), &new_bytes)
            }
            RefStore::Encrypted {
                driver,
                cipher,
                refsname,
            } => {
                validate_branch(branch)?;
                let (raw, mut map) = self.load_map()?;
                if map.get(branch) != expected {
                    return Ok(false);
                }
                map.insert(branch.to_string(), *new);

                let plaintext = rmp_serde::to_vec(&map)?;
                let ciphertext = cipher.encrypt(&plaintext, REFS_AAD)?;
                driver.cas_ref(refsname, raw.as_deref(), &ciphertext)
            }
        }
    }

    /// Read and decrypt the encrypted ref map along with the raw bytes
    /// it came from (the CAS expectation).
    fn load_map(&self) -> Result<(Option<Vec<u8>>, BTreeMap<String, ObjectId>)> {
        let RefStore::Encrypted {
            driver,
            cipher,
            refsname,
        } = self
        else {
            unreachable!("load_map is only called in encrypted mode");
        };
        let Some(raw) = driver.read(refsname, None)? else {
            return Ok((None, BTreeMap::new()));
        };
        let plaintext = cipher.decrypt(&raw, REFS_AAD)?;
        let map: BTreeMap<String, ObjectId> = rmp_serde::from_slice(&plaintext)?;
        Ok((Some(raw), map))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryDriver;
    use cairn_types::oid::ObjectKind;

    fn id(seed: &[u8]) -> ObjectId {
        ObjectId::for_object(ObjectKind::Commit, seed)
    }

    #[test]
    fn plain_refs_cas_flow() {
        let refs = RefStore::plain(Arc::new(MemoryDriver::new()));
        assert_eq!(refs.read_ref("main").unwrap(), None);

        assert!(refs.update_ref("main", None, &id(b"c1")).unwrap());
        assert_eq!(refs.read_ref("main").unwrap(), Some(id(b"c1")));

        // Stale expectation loses.
        assert!(!refs.update_ref("main", None, &id(b"c2")).unwrap());
        assert!(!refs
            .update_ref("main", Some(&id(b"stale")), &id(b"c2"))
            .unwrap());

        assert!(refs
            .update_ref("main", Some(&id(b"c1")), &id(b"c2"))
            .unwrap());
        assert_eq!(refs.read_ref("main").unwrap(), Some(id(b"c2")));
    }

    #[test]
    fn encrypted_refs_cas_flow() {
        let driver = Arc::new(MemoryDriver::new());
        let refs = RefStore::encrypted(driver.clone(), &[0x33; 32], "refs");
        assert_eq!(refs.read_ref("main").unwrap(), None);

        assert!(refs.update_ref("main", None, &id(b"c1")).unwrap());
        assert!(refs.update_ref("other", None, &id(b"o1")).unwrap());
        assert_eq!(refs.read_ref("main").unwrap(), Some(id(b"c1")));
        assert_eq!(refs.read_ref("other").unwrap(), Some(id(b"o1")));

        assert!(!refs.update_ref("main", None, &id(b"c2")).unwrap());
        assert!(refs
            .update_ref("main", Some(&id(b"c1")), &id(b"c2"))
            .unwrap());
        assert_eq!(refs.read_ref("main").unwrap(), Some(id(b"c2")));

        // At rest the map is ciphertext.
        let raw = driver.read("refs/refs", None).unwrap().unwrap();
        assert!(!raw.windows(4).any(|w| w == b"main"));
    }

    #[test]
    fn distinct_refsnames_never_conflict() {
        let driver = Arc::new(MemoryDriver::new());
        let a = RefStore::encrypted(driver.clone(), &[0x33; 32], "refs-a");
        let b = RefStore::encrypted(driver.clone(), &[0x33; 32], "refs-b");
        assert!(a.update_ref("main", None, &id(b"a1")).unwrap());
        assert!(b.update_ref("main", None, &id(b"b1")).unwrap());
        assert_eq!(a.read_ref("main").unwrap(), Some(id(b"a1")));
        assert_eq!(b.read_ref("main").unwrap(), Some(id(b"b1")));
    }

    #[test]
    fn branch_names_are_validated() {
        let refs = RefStore::plain(Arc::new(MemoryDriver::new()));
        for bad in ["", "../x", "/abs", "a..b", "-flag", "trailing/"] {
            assert!(refs.read_ref(bad).is_err(), "accepted '{bad}'");
        }
        for good in ["main", "backups/alpha", "host-1.example.com"] {
            assert!(refs.read_ref(good).is_ok(), "rejected '{good}'");
        }
    }
}
