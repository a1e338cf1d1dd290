pub mod encrypted;
pub mod refs;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::{ObjectId, ObjectKind};
use cairn_types::pack_id::PackId;

use crate::config::Settings;
use crate::crypto::key::{MasterKeys, WrappedKeys};
use crate::storage::{driver_from_settings, ClassHint, StorageDriver};
use crate::store::{ObjectSink, PackStore};

use self::encrypted::EncryptedDriver;
use self::refs::RefStore;

const CONFIG_NAME: &str = "config";
const KEYS_NAME: &str = "keys/repokey";

/// The capability set the save path needs from a repository: object
/// existence and writes, durable finalization, and ref reads/updates.
pub trait Repository: ObjectSink {
    fn exists(&self, id: &ObjectId) -> bool;

    fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)>;

    /// Close in-progress packs and make everything written so far
    /// durable. Must be called before any ref update that references
    /// the new objects.
    fn finish(&mut self) -> Result<Vec<PackId>>;

    fn read_ref(&self, branch: &str) -> Result<Option<ObjectId>>;

    fn update_ref(
        &mut self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool>;

    fn settings(&self) -> &Settings;
}

/// Unencrypted repository over a storage driver.
pub struct PlainRepository {
    settings: Settings,
    store: PackStore,
    refs: RefStore,
}

impl PlainRepository {
    pub fn init(driver: Arc<dyn StorageDriver>, settings: Settings) -> Result<Self> {
        let refs = RefStore::plain(driver.clone());
        Self::init_with(driver, settings, false, refs)
    }

    pub fn open(driver: Arc<dyn StorageDriver>) -> Result<Self> {
        let refs = RefStore::plain(driver.clone());
        Self::open_with(driver, false, refs)
    }

    fn init_with(
        driver: Arc<dyn StorageDriver>,
        settings: Settings,
        encrypted: bool,
        refs: RefStore,
    ) -> Result<Self> {
        settings.validate()?;
        if driver.read(CONFIG_NAME, None)?.is_some() {
            return Err(CairnError::RepoAlreadyExists("repository".into()));
        }
        driver.write(
            CONFIG_NAME,
            settings.to_config_text().as_bytes(),
            ClassHint::MetaSmall,
        )?;
        debug!(encrypted, "initialized repository");
        Self::open_with(driver, encrypted, refs)
    }

    fn open_with(
        driver: Arc<dyn StorageDriver>,
        encrypted: bool,
        refs: RefStore,
    ) -> Result<Self> {
        let raw = driver
            .read(CONFIG_NAME, None)?
            .ok_or_else(|| CairnError::RepoNotFound("config missing".into()))?;
        let text = String::from_utf8(raw)
            .map_err(|_| CairnError::InvalidFormat("config is not UTF-8".into()))?;
        let settings = Settings::from_config_text(&text)?;
        let store = PackStore::open(driver, &settings, encrypted)?;
        Ok(PlainRepository {
            settings,
            store,
            refs,
        })
    }
}

impl ObjectSink for PlainRepository {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        self.store.write_object(kind, payload)
    }

    fn write_meta_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        self.store.write_meta_object(kind, payload)
    }
}

impl Repository for PlainRepository {
    fn exists(&self, id: &ObjectId) -> bool {
        self.store.exists(id)
    }

    fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        self.store.read_object(id)
    }

    fn finish(&mut self) -> Result<Vec<PackId>> {
        self.store.finish()
    }

    fn read_ref(&self, branch: &str) -> Result<Option<ObjectId>> {
        self.refs.read_ref(branch)
    }

    fn update_ref(
        &mut self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool> {
        self.refs.update_ref(branch, expected, new)
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// Encrypted repository: the same pack/idx/ref machinery composed over
/// the block-cipher storage wrapper, plus key management.
pub struct EncryptedRepository {
    keys: MasterKeys,
    inner: PlainRepository,
}

impl EncryptedRepository {
    pub fn init(
        base: Arc<dyn StorageDriver>,
        settings: Settings,
        passphrase: &str,
    ) -> Result<Self> {
        if base.read(KEYS_NAME, None)?.is_some() || base.read(CONFIG_NAME, None)?.is_some() {
            return Err(CairnError::RepoAlreadyExists("repository".into()));
        }

        let keys = MasterKeys::generate();
        let wrapped = keys.to_wrapped(passphrase)?;
        base.write(KEYS_NAME, &rmp_serde::to_vec(&wrapped)?, ClassHint::MetaSmall)?;

        let refs = RefStore::encrypted(base.clone(), &keys.repokey, &settings.refsname);
        let driver = Self::wrap_driver(base, &keys);
        let inner = PlainRepository::init_with(driver, settings, true, refs)?;
        Ok(EncryptedRepository { keys, inner })
    }

    pub fn open(base: Arc<dyn StorageDriver>, passphrase: &str) -> Result<Self> {
        let raw = base
            .read(KEYS_NAME, None)?
            .ok_or_else(|| CairnError::RepoNotFound("key file missing".into()))?;
        let wrapped: WrappedKeys = rmp_serde::from_slice(&raw)?;
        let keys = MasterKeys::from_wrapped(&wrapped, passphrase)?;

        // The refsname is stored in the (encrypted) config; peek at it
        // through a temporary wrapper before wiring the ref store.
        let driver = Self::wrap_driver(base.clone(), &keys);
        let config_raw = driver
            .read(CONFIG_NAME, None)?
            .ok_or_else(|| CairnError::RepoNotFound("config missing".into()))?;
        let text = String::from_utf8(config_raw)
            .map_err(|_| CairnError::InvalidFormat("config is not UTF-8".into()))?;
        let settings = Settings::from_config_text(&text)?;

        let refs = RefStore::encrypted(base, &keys.repokey, &settings.refsname);
        let inner = PlainRepository::open_with(driver, true, refs)?;
        Ok(EncryptedRepository { keys, inner })
    }

    fn wrap_driver(base: Arc<dyn StorageDriver>, keys: &MasterKeys) -> Arc<dyn StorageDriver> {
        Arc::new(EncryptedDriver::new(
            base,
            &keys.repokey,
            keys.write_public(),
            Some(keys.read_secret()),
        ))
    }

    /// The public half data packs are sealed to (for diagnostics).
    pub fn writekey(&self) -> crypto_box::PublicKey {
        self.keys.write_public()
    }
}

impl ObjectSink for EncryptedRepository {
    fn write_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        self.inner.write_object(kind, payload)
    }

    fn write_meta_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        self.inner.write_meta_object(kind, payload)
    }
}

impl Repository for EncryptedRepository {
    fn exists(&self, id: &ObjectId) -> bool {
        self.inner.exists(id)
    }

    fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        self.inner.read_object(id)
    }

    fn finish(&mut self) -> Result<Vec<PackId>> {
        self.inner.finish()
    }

    fn read_ref(&self, branch: &str) -> Result<Option<ObjectId>> {
        self.inner.read_ref(branch)
    }

    fn update_ref(
        &mut self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool> {
        self.inner.update_ref(branch, expected, new)
    }

    fn settings(&self) -> &Settings {
        self.inner.settings()
    }
}

/// Open the repository at `path`, detecting encryption from the
/// presence of the key file.
pub fn open_repository(path: &Path, passphrase: Option<&str>) -> Result<Box<dyn Repository>> {
    let driver = driver_from_settings(&Settings::default(), path)?;
    if driver.read(KEYS_NAME, None)?.is_some() {
        let passphrase = passphrase.ok_or_else(|| {
            CairnError::Config("passphrase required for encrypted repository".into())
        })?;
        Ok(Box::new(EncryptedRepository::open(driver, passphrase)?))
    } else {
        Ok(Box::new(PlainRepository::open(driver)?))
    }
}

/// Initialize a repository at `path`.
pub fn init_repository(
    path: &Path,
    settings: Settings,
    passphrase: Option<&str>,
) -> Result<Box<dyn Repository>> {
    let driver = driver_from_settings(&settings, path)?;
    match passphrase {
        Some(pass) => Ok(Box::new(EncryptedRepository::init(driver, settings, pass)?)),
        None => Ok(Box::new(PlainRepository::init(driver, settings)?)),
    }
}
