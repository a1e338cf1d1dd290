use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use cairn_core::save::{WalkEntry, WalkRecord};
use cairn_types::error::{CairnError, Result};

/// Canonicalized POSIX metadata serialized into each entry's stat
/// bytes. The core treats these as opaque; they land in `.bupm`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime_ns: i64,
}

#[cfg(unix)]
fn stat_of(meta: &fs::Metadata) -> StatInfo {
    use std::os::unix::fs::MetadataExt;
    StatInfo {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
    }
}

#[cfg(not(unix))]
fn stat_of(meta: &fs::Metadata) -> StatInfo {
    StatInfo {
        mode: if meta.is_dir() { 0o40755 } else { 0o100644 },
        uid: 0,
        gid: 0,
        size: meta.len(),
        mtime_ns: 0,
    }
}

fn stat_bytes(meta: &fs::Metadata) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(&stat_of(meta))?)
}

fn synthetic_dir_stat() -> Vec<u8> {
    rmp_serde::to_vec(&StatInfo {
        mode: 0o40755,
        uid: 0,
        gid: 0,
        size: 0,
        mtime_ns: 0,
    })
    .expect("fixed struct serializes")
}

/// Whether a per-entry error should skip the entry rather than abort
/// the session.
fn is_soft_io_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
    )
}

/// The stored paths of the save, merged into one tree: each source path
/// is stripped of the `--strip` prefix and its remaining components
/// become nested directories.
#[derive(Debug)]
enum Node {
    Dir(BTreeMap<String, Node>),
    Source(PathBuf),
}

fn build_forest(paths: &[String], strip: Option<&str>) -> Result<BTreeMap<String, Node>> {
    let mut root = BTreeMap::new();
    for raw in paths {
        let stored = match strip {
            Some(prefix) => raw
                .strip_prefix(prefix)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(raw.as_str()),
            None => raw.trim_start_matches('/'),
        };
        let components: Vec<&str> = stored.split('/').filter(|c| !c.is_empty()).collect();
        let Some((last, dirs)) = components.split_last() else {
            return Err(CairnError::Input(format!(
                "path '{raw}' has no stored name after stripping '{}'",
                strip.unwrap_or_default()
            )));
        };

        let mut cursor = &mut root;
        for dir in dirs {
            let entry = cursor
                .entry((*dir).to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            match entry {
                Node::Dir(children) => cursor = children,
                Node::Source(_) => {
                    return Err(CairnError::Input(format!(
                        "path '{raw}' nests under another source path"
                    )))
                }
            }
        }
        if cursor
            .insert((*last).to_string(), Node::Source(PathBuf::from(raw)))
            .is_some()
        {
            return Err(CairnError::Input(format!(
                "duplicate stored path '{stored}'"
            )));
        }
    }
    Ok(root)
}

#[derive(Debug)]
enum Layer {
    /// Synthetic directories from path stripping/merging. The root
    /// layer emits no close marker.
    Forest {
        iter: std::collections::btree_map::IntoIter<String, Node>,
        close_on_exit: bool,
    },
    /// A real filesystem directory, children sorted by name.
    Dir {
        iter: std::vec::IntoIter<(String, PathBuf)>,
    },
}

enum Step {
    SyntheticDir(String, BTreeMap<String, Node>),
    Visit(String, PathBuf),
    Exhausted { close: bool },
}

/// Walks the sources depth-first, producing the record stream the core
/// consumes: directories, then children, then a close marker. Files
/// are opened lazily, one at a time, as the stream is pulled.
///
/// Unreadable entries are skipped with a warning and counted in the
/// shared counter returned by `error_counter()`.
pub struct FsWalker {
    stack: Vec<Layer>,
    queue: VecDeque<Result<WalkRecord>>,
    errors: Arc<AtomicU64>,
}

impl std::fmt::Debug for FsWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWalker")
            .field("stack", &self.stack)
            .field("queue_len", &self.queue.len())
            .field("errors", &self.errors)
            .finish()
    }
}

impl FsWalker {
    pub fn new(paths: &[String], strip: Option<&str>) -> Result<Self> {
        let forest = build_forest(paths, strip)?;
        Ok(FsWalker {
            stack: vec![Layer::Forest {
                iter: forest.into_iter(),
                close_on_exit: false,
            }],
            queue: VecDeque::new(),
            errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Shared skip counter, usable after the walker has been consumed.
    pub fn error_counter(&self) -> Arc<AtomicU64> {
        self.errors.clone()
    }

    fn soft_skip(&self, path: &Path, what: &str, err: &std::io::Error) {
        warn!(path = %path.display(), error = %err, "skipping {what}");
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Stat one real path and queue its record(s), pushing a new layer
    /// for directories.
    fn visit(&mut self, name: String, path: PathBuf) {
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if is_soft_io_error(&e) => return self.soft_skip(&path, "entry", &e),
            Err(e) => {
                self.queue.push_back(Err(CairnError::Input(format!(
                    "stat {}: {e}",
                    path.display()
                ))));
                return;
            }
        };
        let file_type = meta.file_type();

        if file_type.is_dir() {
            let stat = match stat_bytes(&meta) {
                Ok(s) => s,
                Err(e) => return self.queue.push_back(Err(e)),
            };
            self.queue.push_back(Ok(WalkRecord::Entry(WalkEntry {
                name: name.into_bytes(),
                mode: 0o40000 | (stat_of(&meta).mode & 0o7777),
                stat,
                content: None,
            })));

            let mut children: Vec<(String, PathBuf)> = Vec::new();
            match fs::read_dir(&path) {
                Ok(entries) => {
                    for entry in entries {
                        match entry {
                            Ok(e) => children.push((
                                e.file_name().to_string_lossy().into_owned(),
                                e.path(),
                            )),
                            Err(e) => {
                                self.queue.push_back(Err(CairnError::Input(format!(
                                    "readdir {}: {e}",
                                    path.display()
                                ))));
                                return;
                            }
                        }
                    }
                }
                Err(e) if is_soft_io_error(&e) => {
                    self.soft_skip(&path, "unreadable directory", &e)
                }
                Err(e) => {
                    self.queue.push_back(Err(CairnError::Input(format!(
                        "readdir {}: {e}",
                        path.display()
                    ))));
                    return;
                }
            }
            // Deterministic walk order; the tree builder re-sorts into
            // canonical order anyway, but stable input helps debugging.
            children.sort_by(|a, b| a.0.cmp(&b.0));
            self.stack.push(Layer::Dir {
                iter: children.into_iter(),
            });
        } else if file_type.is_symlink() {
            match (fs::read_link(&path), stat_bytes(&meta)) {
                (Ok(target), Ok(stat)) => {
                    self.queue.push_back(Ok(WalkRecord::Entry(WalkEntry {
                        name: name.into_bytes(),
                        mode: 0o120777,
                        stat,
                        content: Some(Box::new(Cursor::new(
                            target.to_string_lossy().into_owned().into_bytes(),
                        ))),
                    })))
                }
                (Err(e), _) if is_soft_io_error(&e) => self.soft_skip(&path, "symlink", &e),
                (Err(e), _) => self.queue.push_back(Err(CairnError::Input(format!(
                    "readlink {}: {e}",
                    path.display()
                )))),
                (_, Err(e)) => self.queue.push_back(Err(e)),
            }
        } else if file_type.is_file() {
            match (fs::File::open(&path), stat_bytes(&meta)) {
                (Ok(handle), Ok(stat)) => {
                    self.queue.push_back(Ok(WalkRecord::Entry(WalkEntry {
                        name: name.into_bytes(),
                        mode: 0o100000 | (stat_of(&meta).mode & 0o7777),
                        stat,
                        content: Some(Box::new(handle)),
                    })))
                }
                (Err(e), _) if is_soft_io_error(&e) => {
                    self.soft_skip(&path, "unreadable file", &e)
                }
                (Err(e), _) => self.queue.push_back(Err(CairnError::Input(format!(
                    "open {}: {e}",
                    path.display()
                )))),
                (_, Err(e)) => self.queue.push_back(Err(e)),
            }
        }
        // Sockets, FIFOs, and device nodes are skipped silently.
    }
}

impl Iterator for FsWalker {
    type Item = Result<WalkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.queue.pop_front() {
                return Some(record);
            }

            let step = match self.stack.last_mut()? {
                Layer::Forest {
                    iter,
                    close_on_exit,
                } => match iter.next() {
                    Some((name, Node::Dir(children))) => Step::SyntheticDir(name, children),
                    Some((name, Node::Source(path))) => Step::Visit(name, path),
                    None => Step::Exhausted {
                        close: *close_on_exit,
                    },
                },
                Layer::Dir { iter } => match iter.next() {
                    Some((name, path)) => Step::Visit(name, path),
                    None => Step::Exhausted { close: true },
                },
            };

            match step {
                Step::SyntheticDir(name, children) => {
                    self.queue.push_back(Ok(WalkRecord::Entry(WalkEntry {
                        name: name.into_bytes(),
                        mode: 0o40755,
                        stat: synthetic_dir_stat(),
                        content: None,
                    })));
                    self.stack.push(Layer::Forest {
                        iter: children.into_iter(),
                        close_on_exit: true,
                    });
                }
                Step::Visit(name, path) => self.visit(name, path),
                Step::Exhausted { close } => {
                    self.stack.pop();
                    if close {
                        self.queue.push_back(Ok(WalkRecord::CloseDir));
                    }
                }
            }
        }
    }
}
