use std::io::Read;

use cairn_types::error::Result;
use cairn_types::oid::{ObjectId, ObjectKind};

use crate::split::{HashSplitter, RecordSplitter};
use crate::store::ObjectSink;

use super::{encode_tree, TreeEntry, MODE_FILE, MODE_TREE};

/// A tree level is closed unconditionally once it reaches this many
/// children, bounding tree-object size even when boundary levels are
/// sparse.
pub const MAX_TREE_ENTRIES: usize = 256;

/// A child reference accumulated while building a subtree pyramid.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Child {
    pub mode: u32,
    pub id: ObjectId,
    pub size: u64,
}

/// Name the children of one subtree by their zero-padded hex byte
/// offsets, so a reader can seek without decoding sibling subtrees.
fn offset_entries(children: &[Child]) -> (Vec<TreeEntry>, u64) {
    let total: u64 = children.iter().map(|c| c.size).sum();
    let width = format!("{total:x}").len();
    let mut offset = 0u64;
    let entries = children
        .iter()
        .map(|child| {
            let name = format!("{offset:0width$x}").into_bytes();
            offset += child.size;
            TreeEntry {
                mode: child.mode,
                name,
                id: child.id,
            }
        })
        .collect();
    (entries, total)
}

/// Stacked subtree accumulator: leaves collect at level 0, and a
/// level-n boundary folds levels 0..n into subtree objects, one per
/// level. The result is a balanced pyramid where identical subranges
/// of different files share subtree IDs.
pub(crate) struct SubtreeStacks {
    stacks: Vec<Vec<Child>>,
}

impl SubtreeStacks {
    pub fn new() -> Self {
        SubtreeStacks {
            stacks: vec![Vec::new()],
        }
    }

    pub fn push_leaf(&mut self, mode: u32, id: ObjectId, size: u64) {
        self.stacks[0].push(Child { mode, id, size });
    }

    /// Close every level below `level`, and any level that has grown
    /// past `MAX_TREE_ENTRIES`. A single-child level is hoisted without
    /// writing a degenerate one-entry tree.
    pub fn squish(&mut self, level: usize, sink: &mut dyn ObjectSink) -> Result<()> {
        let mut i = 0;
        while i < level || (i < self.stacks.len() && self.stacks[i].len() >= MAX_TREE_ENTRIES) {
            while self.stacks.len() <= i + 1 {
                self.stacks.push(Vec::new());
            }
            if self.stacks[i].len() == 1 {
                let child = self.stacks[i].pop().expect("length checked");
                self.stacks[i + 1].push(child);
            } else if !self.stacks[i].is_empty() {
                let (entries, total) = offset_entries(&self.stacks[i]);
                let id = sink.write_object(ObjectKind::Tree, &encode_tree(&entries))?;
                self.stacks[i + 1].push(Child {
                    mode: MODE_TREE,
                    id,
                    size: total,
                });
                self.stacks[i].clear();
            }
            i += 1;
        }
        Ok(())
    }

    /// Close all open levels and return the children of the root level.
    pub fn finish(&mut self, sink: &mut dyn ObjectSink) -> Result<Vec<Child>> {
        let top = self.stacks.len() - 1;
        self.squish(top, sink)?;
        let children = self
            .stacks
            .iter_mut()
            .rev()
            .find(|s| !s.is_empty())
            .map(std::mem::take)
            .unwrap_or_default();
        Ok(children)
    }
}

/// Hashsplit a file's content into blobs, then build its subtree
/// pyramid from a second-order split over the concatenated blob IDs
/// (each 20-byte ID is one record fed to `splitter`).
///
/// Returns `(gitmode, id, byte_size)`: a plain blob for files that fit
/// a single chunk, a tree for split files. An empty file is exactly the
/// empty blob.
pub fn split_file_to_tree<R: Read>(
    sink: &mut dyn ObjectSink,
    reader: R,
    bits: u32,
    splitter: &mut dyn RecordSplitter,
) -> Result<(u32, ObjectId, u64)> {
    let mut stacks = SubtreeStacks::new();
    let mut wrote_any = false;

    for item in HashSplitter::new(reader, bits) {
        let (blob, _) = item?;
        let size = blob.len() as u64;
        let id = sink.write_object(ObjectKind::Blob, &blob)?;
        wrote_any = true;
        stacks.push_leaf(MODE_FILE, id, size);
        let level = splitter.feed(id.as_bytes()).unwrap_or(0) as usize;
        stacks.squish(level, sink)?;
    }

    if !wrote_any {
        let id = sink.write_object(ObjectKind::Blob, b"")?;
        return Ok((MODE_FILE, id, 0));
    }

    let top = stacks.finish(sink)?;
    match top.as_slice() {
        [only] => Ok((only.mode, only.id, only.size)),
        children => {
            let (entries, total) = offset_entries(children);
            let id = sink.write_object(ObjectKind::Tree, &encode_tree(&entries))?;
            Ok((MODE_TREE, id, total))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::RollsumRecordSplitter;
    use crate::testutil::{MemSink, SplitEveryN};
    use crate::tree::decode_tree;
    use std::io::Cursor;

    /// Reassemble a file's bytes by walking its blob-or-tree.
    fn read_back(sink: &MemSink, mode: u32, id: &ObjectId) -> Vec<u8> {
        if mode == MODE_TREE {
            let (_, payload) = sink.get(id).expect("tree present");
            decode_tree(&payload)
                .unwrap()
                .iter()
                .flat_map(|entry| read_back(sink, entry.mode, &entry.id))
                .collect()
        } else {
            sink.get(id).expect("blob present").1
        }
    }

    #[test]
    fn empty_file_is_the_empty_blob() {
        let mut sink = MemSink::new();
        let mut splitter = RollsumRecordSplitter::new(13);
        let (mode, id, size) =
            split_file_to_tree(&mut sink, Cursor::new(Vec::<u8>::new()), 13, &mut splitter)
                .unwrap();
        assert_eq!(mode, MODE_FILE);
        assert_eq!(size, 0);
        assert_eq!(id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn small_file_is_a_single_blob() {
        let mut sink = MemSink::new();
        let mut splitter = RollsumRecordSplitter::new(13);
        let data = b"just a few bytes".to_vec();
        let (mode, id, size) =
            split_file_to_tree(&mut sink, Cursor::new(data.clone()), 13, &mut splitter).unwrap();
        assert_eq!(mode, MODE_FILE);
        assert_eq!(size, data.len() as u64);
        assert_eq!(sink.get(&id).unwrap().1, data);
    }

    #[test]
    fn split_file_reassembles_exactly() {
        let mut sink = MemSink::new();
        // Zeros force ceiling splits: 10 blobs of 4<<13 bytes.
        let data = vec![0u8; 10 * (4 << 13)];
        let mut splitter = SplitEveryN::new(3);
        let (mode, id, size) =
            split_file_to_tree(&mut sink, Cursor::new(data.clone()), 13, &mut splitter).unwrap();
        assert_eq!(mode, MODE_TREE);
        assert_eq!(size, data.len() as u64);
        assert_eq!(read_back(&sink, mode, &id), data);
    }

    #[test]
    fn file_tree_is_deterministic() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i.wrapping_mul(48271) >> 16) as u8).collect();
        let run = || {
            let mut sink = MemSink::new();
            let mut splitter = RollsumRecordSplitter::new(13);
            split_file_to_tree(&mut sink, Cursor::new(data.clone()), 13, &mut splitter).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn overfull_level_closes_at_entry_cap() {
        let mut sink = MemSink::new();
        let mut stacks = SubtreeStacks::new();
        // Push more leaves than one tree may hold, never signalling a
        // boundary; the cap must fold them anyway.
        for i in 0..(MAX_TREE_ENTRIES * 2 + 10) as u64 {
            let id = ObjectId::for_object(ObjectKind::Blob, &i.to_le_bytes());
            stacks.push_leaf(MODE_FILE, id, 1);
            stacks.squish(0, &mut sink).unwrap();
        }
        let top = stacks.finish(&mut sink).unwrap();
        assert!(top.len() < MAX_TREE_ENTRIES);
        for (_, (kind, payload)) in sink.iter() {
            if *kind == ObjectKind::Tree {
                assert!(decode_tree(payload).unwrap().len() <= MAX_TREE_ENTRIES);
            }
        }
    }
}
