use std::io::Read;

use tracing::{debug, warn};

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::{ObjectId, ObjectKind};

use crate::repo::Repository;
use crate::split::{RecordSplitter, RollsumRecordSplitter, TREE_SPLIT_BITS};
use crate::tree::build::split_file_to_tree;
use crate::tree::split::{write_dir_tree, DirItem};
use crate::tree::{
    encode_commit, is_file_mode, is_symlink_mode, is_tree_mode, Commit, CommitIdent, MODE_EXEC,
    MODE_FILE, MODE_SYMLINK, MODE_TREE,
};

/// Bounded rebase retries when the final ref CAS loses its race.
pub const REF_UPDATE_RETRIES: usize = 10;

/// One record from the external indexer. Directories arrive depth-first
/// with their children between the directory's own entry and the
/// matching `CloseDir`.
pub struct WalkEntry {
    /// Base name within the enclosing directory.
    pub name: Vec<u8>,
    /// POSIX mode; the file-type bits select directory/file/symlink.
    pub mode: u32,
    /// Canonicalized metadata bytes, opaque to the core; lands in the
    /// enclosing directory's `.bupm`.
    pub stat: Vec<u8>,
    /// File bytes, or the target path for a symlink. `None` for
    /// directories.
    pub content: Option<Box<dyn Read>>,
}

pub enum WalkRecord {
    Entry(WalkEntry),
    CloseDir,
}

/// Parameters of one save session.
pub struct SaveOptions {
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    /// Commit timestamp, seconds since the epoch.
    pub when: i64,
    pub message: String,
}

impl SaveOptions {
    pub fn new(branch: &str) -> Self {
        SaveOptions {
            branch: branch.to_string(),
            author_name: "cairn".to_string(),
            author_email: "cairn@localhost".to_string(),
            when: chrono::Utc::now().timestamp(),
            message: format!("cairn save of '{branch}'"),
        }
    }
}

struct Frame {
    name: Vec<u8>,
    meta: Vec<u8>,
    items: Vec<DirItem>,
}

/// Consume a walk-record stream, build the object graph, and move the
/// branch to a new commit. Returns the commit ID.
///
/// On input errors the already-sealed packs are finalized (their
/// objects remain valid for future dedup) and no ref is updated.
pub fn save_stream<I>(
    repo: &mut dyn Repository,
    records: I,
    opts: &SaveOptions,
) -> Result<ObjectId>
where
    I: IntoIterator<Item = Result<WalkRecord>>,
{
    match build_root_tree(repo, records) {
        Ok(root_tree) => commit_and_advance(repo, root_tree, opts),
        Err(e) => {
            // Finalize whatever was durably written so a rerun dedups
            // against it; the branch is untouched.
            if let Err(flush_err) = repo.finish() {
                warn!("finalizing partial packs after error also failed: {flush_err}");
            }
            Err(e)
        }
    }
}

fn build_root_tree<I>(repo: &mut dyn Repository, records: I) -> Result<ObjectId>
where
    I: IntoIterator<Item = Result<WalkRecord>>,
{
    let bits = repo.settings().blob_bits;
    let treesplit = repo.settings().treesplit;

    let mut frames: Vec<Frame> = vec![Frame {
        name: Vec::new(),
        meta: Vec::new(),
        items: Vec::new(),
    }];

    for record in records {
        match record? {
            WalkRecord::Entry(entry) => {
                if is_tree_mode(entry.mode) {
                    frames.push(Frame {
                        name: entry.name,
                        meta: entry.stat,
                        items: Vec::new(),
                    });
                } else {
                    let item = process_entry(repo, entry, bits, &frames)?;
                    frames.last_mut().expect("root frame").items.push(item);
                }
            }
            WalkRecord::CloseDir => {
                if frames.len() < 2 {
                    return Err(CairnError::Input(
                        "close_dir without a matching directory".into(),
                    ));
                }
                let frame = frames.pop().expect("length checked");
                let id = finish_dir(repo, frame.items, &frame.meta, treesplit, bits)?;
                frames.last_mut().expect("parent frame").items.push(DirItem {
                    name: frame.name,
                    mode: MODE_TREE,
                    gitmode: MODE_TREE,
                    id,
                    meta: Vec::new(),
                });
            }
        }
    }

    if frames.len() != 1 {
        return Err(CairnError::Input(format!(
            "stream ended with {} unclosed directories",
            frames.len() - 1
        )));
    }

    let root = frames.pop().expect("root frame");
    if root.items.is_empty() {
        // No entries at all: the canonical empty tree.
        repo.write_object(ObjectKind::Tree, b"")
    } else {
        finish_dir(repo, root.items, &root.meta, treesplit, bits)
    }
}

/// Store one non-directory walk entry and describe it for the
/// enclosing frame.
fn process_entry(
    repo: &mut dyn Repository,
    entry: WalkEntry,
    bits: u32,
    frames: &[Frame],
) -> Result<DirItem> {
    let display_str = display_path(frames, &entry.name);

    if is_symlink_mode(entry.mode) {
        let mut reader = entry.content.ok_or_else(|| {
            CairnError::Input(format!("{display_str}: symlink entry without a target"))
        })?;
        let mut target = Vec::new();
        reader
            .read_to_end(&mut target)
            .map_err(|e| CairnError::Input(format!("{display_str}: {e}")))?;
        let id = repo.write_object(ObjectKind::Blob, &target)?;
        return Ok(DirItem {
            name: entry.name,
            mode: entry.mode,
            gitmode: MODE_SYMLINK,
            id,
            meta: entry.stat,
        });
    }

    if is_file_mode(entry.mode) {
        let reader = entry
            .content
            .ok_or_else(|| CairnError::Input(format!("{display_str}: file entry without content")))?;
        let mut splitter = RollsumRecordSplitter::new(bits);
        let (gitmode, id, size) = split_file_to_tree(&mut &mut *repo, reader, bits, &mut splitter)
            .map_err(|e| annotate_input(e, &display_str))?;
        let gitmode = if gitmode == MODE_FILE && entry.mode & 0o111 != 0 {
            MODE_EXEC
        } else {
            gitmode
        };
        debug!(path = %display_str, size, split = gitmode == MODE_TREE, "saved file");
        return Ok(DirItem {
            name: entry.name,
            mode: entry.mode,
            gitmode,
            id,
            meta: entry.stat,
        });
    }

    Err(CairnError::Input(format!(
        "{display_str}: unsupported mode {:o}",
        entry.mode
    )))
}

fn finish_dir(
    repo: &mut dyn Repository,
    items: Vec<DirItem>,
    dir_meta: &[u8],
    treesplit: bool,
    bits: u32,
) -> Result<ObjectId> {
    let mut factory: Box<dyn FnMut() -> Box<dyn RecordSplitter>> =
        Box::new(|| Box::new(RollsumRecordSplitter::new(TREE_SPLIT_BITS)));
    write_dir_tree(&mut &mut *repo, items, dir_meta, treesplit, bits, &mut *factory)
}

fn display_path(frames: &[Frame], name: &[u8]) -> String {
    let mut parts: Vec<String> = frames
        .iter()
        .skip(1)
        .map(|f| String::from_utf8_lossy(&f.name).into_owned())
        .collect();
    parts.push(String::from_utf8_lossy(name).into_owned());
    parts.join("/")
}

fn annotate_input(e: CairnError, path: &str) -> CairnError {
    match e {
        CairnError::Input(msg) => CairnError::Input(format!("{path}: {msg}")),
        other => other,
    }
}

/// Write the commit and advance the branch, rebasing onto the new tip
/// when the CAS loses a race with a concurrent writer.
fn commit_and_advance(
    repo: &mut dyn Repository,
    root_tree: ObjectId,
    opts: &SaveOptions,
) -> Result<ObjectId> {
    let ident = CommitIdent {
        name: opts.author_name.clone(),
        email: opts.author_email.clone(),
        when: opts.when,
    };

    for attempt in 0..REF_UPDATE_RETRIES {
        let tip = repo.read_ref(&opts.branch)?;
        let commit = Commit {
            tree: root_tree,
            parents: tip.iter().copied().collect(),
            author: ident.clone(),
            committer: ident.clone(),
            message: opts.message.clone(),
        };
        let commit_id = repo.write_object(ObjectKind::Commit, &encode_commit(&commit))?;

        // Every referenced pack must be durable before the ref moves.
        repo.finish()?;

        if repo.update_ref(&opts.branch, tip.as_ref(), &commit_id)? {
            debug!(branch = %opts.branch, commit = %commit_id, "branch updated");
            return Ok(commit_id);
        }
        warn!(
            branch = %opts.branch,
            attempt = attempt + 1,
            "lost ref update race, re-parenting commit"
        );
    }
    Err(CairnError::RefConflict(opts.branch.clone()))
}
