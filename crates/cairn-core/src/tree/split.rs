use std::io::Cursor;

use tracing::warn;

use cairn_types::error::Result;
use cairn_types::oid::{ObjectId, ObjectKind};

use crate::split::{RecordSplitter, RollsumRecordSplitter};
use crate::store::{MetaStream, ObjectSink};

use super::build::split_file_to_tree;
use super::{
    canonical_sort, encode_tree, entry_sort_key, is_tree_mode, mangle_name, TreeEntry, MODE_TREE,
};

/// One finished entry of a directory being assembled: the stored child
/// plus the metadata bytes that will ride in the directory's `.bupm`.
#[derive(Debug, Clone)]
pub struct DirItem {
    /// Entry name as the user sees it (unmangled).
    pub name: Vec<u8>,
    /// POSIX mode reported by the indexer.
    pub mode: u32,
    /// Git mode of the stored child (differs from `mode` when a file
    /// was hashsplit into a tree).
    pub gitmode: u32,
    pub id: ObjectId,
    /// Canonicalized stat bytes; empty for directories, whose metadata
    /// lives in their own `.bupm`.
    pub meta: Vec<u8>,
}

/// How a tree's `.bupm` companion is assembled.
enum MetaMode<'a> {
    /// Directory's own metadata first, then its non-tree entries.
    WithDirMeta(&'a [u8]),
    /// Only the entries' metadata (tree-split slices past the first).
    SliceOnly,
    /// No `.bupm` at all (grouping trees inside a split directory).
    None,
}

/// Write a directory tree. With `treesplit` enabled and a listing large
/// enough for the record splitter to fire, the entries are folded into
/// a multi-level tree whose root carries a `.bupd` marker; otherwise a
/// single flat tree is produced.
pub fn write_dir_tree(
    sink: &mut dyn ObjectSink,
    mut items: Vec<DirItem>,
    dir_meta: &[u8],
    treesplit: bool,
    bits: u32,
    splitter_factory: &mut dyn FnMut() -> Box<dyn RecordSplitter>,
) -> Result<ObjectId> {
    items.sort_by(|a, b| {
        entry_sort_key(&a.name, a.gitmode).cmp(&entry_sort_key(&b.name, b.gitmode))
    });
    drop_duplicate_names(&mut items);

    if treesplit {
        let groups = group_items(&items, splitter_factory());
        if groups.len() > 1 {
            return write_split_tree(sink, &groups, dir_meta, bits, splitter_factory);
        }
    }
    write_plain_tree(sink, &items, MetaMode::WithDirMeta(dir_meta), None, bits)
}

/// The same name never appears twice in one tree: keep the first
/// occurrence, drop the rest loudly.
fn drop_duplicate_names(items: &mut Vec<DirItem>) {
    let mut seen: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
    items.retain(|item| {
        if seen.insert(item.name.clone()) {
            true
        } else {
            warn!(
                "ignoring duplicate entry '{}' in directory listing",
                String::from_utf8_lossy(&item.name)
            );
            false
        }
    });
}

/// Encode and store one flat tree: optional `.bupm`, the entries under
/// their mangled names, and an optional marker entry.
fn write_plain_tree(
    sink: &mut dyn ObjectSink,
    items: &[DirItem],
    meta: MetaMode<'_>,
    marker: Option<Vec<u8>>,
    bits: u32,
) -> Result<ObjectId> {
    let mut entries: Vec<TreeEntry> = Vec::with_capacity(items.len() + 2);

    let metadata = match meta {
        MetaMode::WithDirMeta(dir_meta) => Some(collect_metadata(items, Some(dir_meta))),
        MetaMode::SliceOnly => Some(collect_metadata(items, None)),
        MetaMode::None => None,
    };
    if let Some(payload) = metadata {
        let mut splitter = RollsumRecordSplitter::new(bits);
        let (gitmode, id, _) =
            split_file_to_tree(&mut MetaStream(sink), Cursor::new(payload), bits, &mut splitter)?;
        entries.push(TreeEntry {
            mode: gitmode,
            name: b".bupm".to_vec(),
            id,
        });
    }

    for item in items {
        entries.push(TreeEntry {
            mode: item.gitmode,
            name: mangle_name(&item.name, item.mode, item.gitmode),
            id: item.id,
        });
    }

    if let Some(name) = marker {
        let id = sink.write_meta_object(ObjectKind::Blob, b"")?;
        entries.push(TreeEntry {
            mode: super::MODE_FILE,
            name,
            id,
        });
    }

    canonical_sort(&mut entries);
    sink.write_object(ObjectKind::Tree, &encode_tree(&entries))
}

/// Concatenate the metadata records for one tree's `.bupm`: the
/// directory's own record first (when present), then each non-tree
/// entry's record in canonical entry order.
fn collect_metadata(items: &[DirItem], dir_meta: Option<&[u8]>) -> Vec<u8> {
    let mut records: Vec<(Vec<u8>, &[u8])> = Vec::new();
    if let Some(dm) = dir_meta {
        records.push((Vec::new(), dm));
    }
    for item in items {
        if !is_tree_mode(item.gitmode) {
            records.push((entry_sort_key(&item.name, item.gitmode), &item.meta));
        }
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));
    records.into_iter().flat_map(|(_, m)| m.to_vec()).collect()
}

/// Partition sorted entries into runs by feeding each entry name to the
/// record splitter; a boundary closes the current run.
fn group_items<'a>(
    items: &'a [DirItem],
    mut splitter: Box<dyn RecordSplitter>,
) -> Vec<&'a [DirItem]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for (i, item) in items.iter().enumerate() {
        if splitter.feed(&item.name).map_or(false, |level| level >= 1) {
            groups.push(&items[start..=i]);
            start = i + 1;
        }
    }
    if start < items.len() {
        groups.push(&items[start..]);
    }
    if groups.is_empty() {
        groups.push(items);
    }
    groups
}

/// Shortest prefixes of each group's first entry name that distinguish
/// sorted neighbours; these become the grouping trees' names (e.g.
/// `000/0001/`).
fn abbreviate_names(firsts: &[&[u8]]) -> Vec<Vec<u8>> {
    let lcp = |a: &[u8], b: &[u8]| a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    firsts
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let left = if i > 0 { lcp(name, firsts[i - 1]) } else { 0 };
            let right = if i + 1 < firsts.len() {
                lcp(name, firsts[i + 1])
            } else {
                0
            };
            let keep = (left.max(right) + 1).min(name.len());
            name[..keep].to_vec()
        })
        .collect()
}

/// Build the multi-level split tree: leaf slices carry their own
/// `.bupm` (the directory's metadata rides in the first slice), the
/// grouped listing recurses with a fresh splitter per level, and the
/// root gains a `.bupd.<depth>.bupd` marker recording how many grouping
/// levels a reader must flatten.
fn write_split_tree(
    sink: &mut dyn ObjectSink,
    groups: &[&[DirItem]],
    dir_meta: &[u8],
    bits: u32,
    splitter_factory: &mut dyn FnMut() -> Box<dyn RecordSplitter>,
) -> Result<ObjectId> {
    let firsts: Vec<&[u8]> = groups.iter().map(|g| g[0].name.as_slice()).collect();
    let names = abbreviate_names(&firsts);

    let mut current: Vec<DirItem> = Vec::with_capacity(groups.len());
    for (i, (group, name)) in groups.iter().zip(names).enumerate() {
        let meta = if i == 0 {
            MetaMode::WithDirMeta(dir_meta)
        } else {
            MetaMode::SliceOnly
        };
        let id = write_plain_tree(sink, group, meta, None, bits)?;
        current.push(DirItem {
            name,
            mode: MODE_TREE,
            gitmode: MODE_TREE,
            id,
            meta: Vec::new(),
        });
    }

    let mut depth = 1usize;
    loop {
        let groups = group_items(&current, splitter_factory());
        if groups.len() <= 1 {
            let marker = format!(".bupd.{depth}.bupd").into_bytes();
            return write_plain_tree(sink, &current, MetaMode::None, Some(marker), bits);
        }

        let firsts: Vec<&[u8]> = groups.iter().map(|g| g[0].name.as_slice()).collect();
        let names = abbreviate_names(&firsts);
        let mut next: Vec<DirItem> = Vec::with_capacity(groups.len());
        for (group, name) in groups.iter().zip(names) {
            let id = write_plain_tree(sink, group, MetaMode::None, None, bits)?;
            next.push(DirItem {
                name,
                mode: MODE_TREE,
                gitmode: MODE_TREE,
                id,
                meta: Vec::new(),
            });
        }
        current = next;
        depth += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemSink, SplitEveryN};
    use crate::tree::{decode_tree, MODE_FILE};

    fn file_item(name: &str, seed: &[u8]) -> DirItem {
        DirItem {
            name: name.as_bytes().to_vec(),
            mode: MODE_FILE,
            gitmode: MODE_FILE,
            id: ObjectId::for_object(ObjectKind::Blob, seed),
            meta: format!("meta:{name}").into_bytes(),
        }
    }

    fn every_five() -> Box<dyn FnMut() -> Box<dyn RecordSplitter>> {
        Box::new(|| Box::new(SplitEveryN::new(5)))
    }

    /// Collect `path -> id` for every entry reachable from a tree.
    fn physical_paths(
        sink: &MemSink,
        id: &ObjectId,
        prefix: &str,
        out: &mut std::collections::BTreeMap<String, ObjectId>,
    ) {
        let (_, payload) = sink.get(id).expect("tree present");
        for entry in decode_tree(&payload).unwrap() {
            let path = if prefix.is_empty() {
                String::from_utf8_lossy(&entry.name).into_owned()
            } else {
                format!("{prefix}/{}", String::from_utf8_lossy(&entry.name))
            };
            if is_tree_mode(entry.mode) {
                physical_paths(sink, &entry.id, &path, out);
            }
            out.insert(path, entry.id);
        }
    }

    #[test]
    fn grouping_matches_the_pinned_layout() {
        // 26 files named 00010001..00260026, splitter forced to close a
        // group every 5 entries.
        let mut sink = MemSink::new();
        let items: Vec<DirItem> = (1..=26)
            .map(|i| file_item(&format!("{i:04}{i:04}"), &[i as u8]))
            .collect();
        let root = write_dir_tree(
            &mut sink,
            items,
            b"dirmeta",
            true,
            13,
            &mut *every_five(),
        )
        .unwrap();

        let mut paths = std::collections::BTreeMap::new();
        physical_paths(&sink, &root, "", &mut paths);

        assert!(paths.contains_key("000/0001/00010001"), "paths: {paths:?}");
        assert!(paths.contains_key("002/0026/00260026"));
        assert!(paths.contains_key("002/0026/.bupm"));
        assert!(!paths.contains_key("002/.bupm"));
        // Root carries the split marker.
        assert!(paths.keys().any(|p| !p.contains('/') && p.ends_with(".bupd")));
    }

    #[test]
    fn split_and_plain_trees_differ_but_list_the_same_entries() {
        let items: Vec<DirItem> = (1..=26)
            .map(|i| file_item(&format!("{i:04}{i:04}"), &[i as u8]))
            .collect();

        let mut plain_sink = MemSink::new();
        let plain = write_dir_tree(
            &mut plain_sink,
            items.clone(),
            b"dirmeta",
            false,
            13,
            &mut *every_five(),
        )
        .unwrap();

        let mut split_sink = MemSink::new();
        let split = write_dir_tree(
            &mut split_sink,
            items.clone(),
            b"dirmeta",
            true,
            13,
            &mut *every_five(),
        )
        .unwrap();

        assert_ne!(plain, split, "split-ness must be structurally visible");

        // Logical walk: flatten the marker-declared grouping levels and
        // compare the real entry sets.
        let logical = |sink: &MemSink, id: &ObjectId| -> std::collections::BTreeMap<String, ObjectId> {
            let (_, payload) = sink.get(id).unwrap();
            let entries = decode_tree(&payload).unwrap();
            let depth = entries.iter().find_map(|e| {
                let name = String::from_utf8_lossy(&e.name).into_owned();
                name.strip_prefix(".bupd.")
                    .and_then(|rest| rest.strip_suffix(".bupd"))
                    .and_then(|d| d.parse::<usize>().ok())
            });
            let mut flat = std::collections::BTreeMap::new();
            match depth {
                None => {
                    for e in entries {
                        if e.name != b".bupm" {
                            flat.insert(String::from_utf8_lossy(&e.name).into_owned(), e.id);
                        }
                    }
                }
                Some(levels) => {
                    fn descend(
                        sink: &MemSink,
                        id: &ObjectId,
                        levels: usize,
                        flat: &mut std::collections::BTreeMap<String, ObjectId>,
                    ) {
                        let (_, payload) = sink.get(id).unwrap();
                        for e in decode_tree(&payload).unwrap() {
                            let name = String::from_utf8_lossy(&e.name).into_owned();
                            if name == ".bupm" || name.ends_with(".bupd") {
                                continue;
                            }
                            if levels > 0 {
                                descend(sink, &e.id, levels - 1, flat);
                            } else {
                                flat.insert(name, e.id);
                            }
                        }
                    }
                    descend(sink, id, levels, &mut flat);
                }
            }
            flat
        };

        let plain_entries = logical(&plain_sink, &plain);
        let split_entries = logical(&split_sink, &split);
        assert_eq!(plain_entries, split_entries);
        assert_eq!(plain_entries.len(), 26);
    }

    #[test]
    fn splitter_that_never_fires_produces_a_plain_tree() {
        let items: Vec<DirItem> = (0..10).map(|i| file_item(&format!("f{i}"), &[i])).collect();
        let mut sink = MemSink::new();
        let mut factory: Box<dyn FnMut() -> Box<dyn RecordSplitter>> =
            Box::new(|| Box::new(SplitEveryN::new(usize::MAX)));
        let root = write_dir_tree(&mut sink, items, b"m", true, 13, &mut *factory).unwrap();

        let (_, payload) = sink.get(&root).unwrap();
        let entries = decode_tree(&payload).unwrap();
        assert!(entries.iter().any(|e| e.name == b".bupm"));
        assert!(!entries.iter().any(|e| e.name.ends_with(b".bupd")));
        assert_eq!(entries.len(), 11);
    }

    #[test]
    fn duplicate_names_are_dropped() {
        let mut items: Vec<DirItem> = vec![file_item("same", b"1")];
        items.push(file_item("same", b"2"));
        let mut sink = MemSink::new();
        let mut factory: Box<dyn FnMut() -> Box<dyn RecordSplitter>> =
            Box::new(|| Box::new(SplitEveryN::new(usize::MAX)));
        let root = write_dir_tree(&mut sink, items, b"m", false, 13, &mut *factory).unwrap();
        let (_, payload) = sink.get(&root).unwrap();
        let entries = decode_tree(&payload).unwrap();
        let same: Vec<_> = entries.iter().filter(|e| e.name == b"same").collect();
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].id, ObjectId::for_object(ObjectKind::Blob, b"1"));
    }

    #[test]
    fn abbreviations_are_shortest_distinguishing_prefixes() {
        let names: Vec<&[u8]> = vec![
            b"00010001", b"00060006", b"00110011", b"00160016", b"00210021", b"00260026",
        ];
        let abbrev = abbreviate_names(&names);
        assert_eq!(
            abbrev,
            vec![
                b"0001".to_vec(),
                b"0006".to_vec(),
                b"0011".to_vec(),
                b"0016".to_vec(),
                b"0021".to_vec(),
                b"0026".to_vec(),
            ]
        );

        let pair: Vec<&[u8]> = vec![b"0001", b"0026"];
        assert_eq!(abbreviate_names(&pair), vec![b"000".to_vec(), b"002".to_vec()]);
    }
}
