use std::sync::Arc;

use cairn_types::oid::{ObjectId, ObjectKind};

use crate::config::Settings;
use crate::storage::StorageDriver;
use crate::store::{ObjectSink, PackStore, MIDX_MIN_IDXES};
use crate::testutil::MemoryDriver;

fn open_store(driver: &Arc<MemoryDriver>, settings: &Settings) -> PackStore {
    let dynamic: Arc<dyn crate::storage::StorageDriver> = driver.clone();
    PackStore::open(dynamic, settings, false).expect("store opens")
}

#[test]
fn write_exists_finish_reopen() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    let mut store = open_store(&driver, &settings);
    let (id, was_new) = store.write(ObjectKind::Blob, b"some file data").unwrap();
    assert!(was_new);
    assert!(store.exists(&id), "pending objects must be visible");

    let packs = store.finish().unwrap();
    assert_eq!(packs.len(), 1);
    assert!(store.exists(&id));

    // A reopened store sees the object through the idx.
    let store2 = open_store(&driver, &settings);
    assert!(store2.exists(&id));
    assert_eq!(store2.idx_count(), 1);
    let (kind, payload) = store2.read_object(&id).unwrap();
    assert_eq!(kind, ObjectKind::Blob);
    assert_eq!(payload, b"some file data");
}

#[test]
fn duplicate_write_adds_nothing() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    let mut store = open_store(&driver, &settings);
    store.write(ObjectKind::Blob, b"payload").unwrap();
    store.finish().unwrap();
    let baseline = driver.total_bytes();

    let mut store = open_store(&driver, &settings);
    let (_, was_new) = store.write(ObjectKind::Blob, b"payload").unwrap();
    assert!(!was_new);
    let packs = store.finish().unwrap();
    assert!(packs.is_empty(), "no pack should be written for a dup");
    assert_eq!(driver.total_bytes(), baseline);
}

#[test]
fn separatemeta_routes_kinds_to_distinct_packs() {
    let driver = Arc::new(MemoryDriver::new());
    let mut settings = Settings::default();
    settings.separatemeta = true;

    let mut store = open_store(&driver, &settings);
    store.write(ObjectKind::Blob, b"file bytes").unwrap();
    store
        .write(ObjectKind::Tree, b"100644 f\0AAAAAAAAAAAAAAAAAAAA")
        .unwrap();
    store.write_meta_object(ObjectKind::Blob, b"metadata blob").unwrap();
    let packs = store.finish().unwrap();
    assert_eq!(packs.len(), 2, "one data pack and one meta pack");

    let names = driver.names();
    assert_eq!(names.iter().filter(|n| n.ends_with(".pack")).count(), 2);
    assert_eq!(names.iter().filter(|n| n.ends_with(".idx")).count(), 2);
}

#[test]
fn without_separatemeta_everything_shares_one_pack() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    let mut store = open_store(&driver, &settings);
    store.write(ObjectKind::Blob, b"file bytes").unwrap();
    store.write(ObjectKind::Tree, b"tree bytes go here").unwrap();
    let packs = store.finish().unwrap();
    assert_eq!(packs.len(), 1);
}

#[test]
fn small_size_limit_rotates_packs() {
    let driver = Arc::new(MemoryDriver::new());
    let mut settings = Settings::default();
    settings.pack_size_limit = 64;

    let mut store = open_store(&driver, &settings);
    for i in 0..4u32 {
        // Incompressible-ish distinct payloads so each exceeds the cap.
        let payload: Vec<u8> = (0..256u32)
            .map(|j| (i.wrapping_mul(2654435761).wrapping_add(j * 97) >> 8) as u8)
            .collect();
        store.write(ObjectKind::Blob, &payload).unwrap();
    }
    let packs = store.finish().unwrap();
    assert_eq!(packs.len(), 4, "each object triggers rotation at a 64-byte cap");
}

#[test]
fn midx_is_built_once_enough_idxes_accumulate() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    let mut ids: Vec<ObjectId> = Vec::new();
    for i in 0..MIDX_MIN_IDXES {
        let mut store = open_store(&driver, &settings);
        let (id, _) = store
            .write(ObjectKind::Blob, format!("pack number {i}").as_bytes())
            .unwrap();
        ids.push(id);
        store.finish().unwrap();
    }

    let names = driver.names();
    assert_eq!(
        names.iter().filter(|n| n.ends_with(".midx")).count(),
        1,
        "names: {names:?}"
    );

    // A store reopened with the midx answers membership for every pack.
    let store = open_store(&driver, &settings);
    for id in &ids {
        assert!(store.exists(id));
    }
    let absent = ObjectId::for_object(ObjectKind::Blob, b"never written");
    assert!(!store.exists(&absent));
}

#[test]
fn stale_midx_is_ignored() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    for i in 0..MIDX_MIN_IDXES {
        let mut store = open_store(&driver, &settings);
        store
            .write(ObjectKind::Blob, format!("pack number {i}").as_bytes())
            .unwrap();
        store.finish().unwrap();
    }
    // Remove one covered idx; the midx now over-claims.
    let victim = driver
        .names()
        .into_iter()
        .find(|n| n.ends_with(".idx"))
        .unwrap();
    driver.delete(&victim).unwrap();

    // Open must succeed, with the stale midx dropped.
    let store = open_store(&driver, &settings);
    assert_eq!(store.idx_count(), MIDX_MIN_IDXES - 1);
}

#[test]
fn corrupt_idx_is_quarantined_on_open() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    let mut store = open_store(&driver, &settings);
    let (id, _) = store.write(ObjectKind::Blob, b"victim").unwrap();
    store.finish().unwrap();

    let idx_name = driver
        .names()
        .into_iter()
        .find(|n| n.ends_with(".idx"))
        .unwrap();
    let mut bytes = driver.read(&idx_name, None).unwrap().unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    driver.clobber(&idx_name, bytes);

    let store = open_store(&driver, &settings);
    assert_eq!(store.idx_count(), 0);
    assert!(!store.exists(&id));
    let names = driver.names();
    assert!(names.iter().any(|n| n.ends_with(".idx.quarantine")));
    assert!(!names.contains(&idx_name));
}

#[test]
fn read_object_detects_id_mismatch() {
    let driver = Arc::new(MemoryDriver::new());
    let settings = Settings::default();

    let mut store = open_store(&driver, &settings);
    let (id, _) = store.write(ObjectKind::Blob, b"original payload").unwrap();
    store.finish().unwrap();

    // Corrupt the pack body under the same name.
    let pack_name = driver
        .names()
        .into_iter()
        .find(|n| n.ends_with(".pack"))
        .unwrap();
    let mut bytes = driver.read(&pack_name, None).unwrap().unwrap();
    let len = bytes.len();
    bytes[len / 2] ^= 0x01;
    driver.clobber(&pack_name, bytes);

    let store = open_store(&driver, &settings);
    assert!(store.read_object(&id).is_err());
}
