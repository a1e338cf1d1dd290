pub mod build;
pub mod split;

use cairn_types::error::{CairnError, Result};
use cairn_types::oid::ObjectId;

/// Git-compatible entry modes.
pub const MODE_FILE: u32 = 0o100644;
pub const MODE_EXEC: u32 = 0o100755;
pub const MODE_TREE: u32 = 0o40000;
pub const MODE_SYMLINK: u32 = 0o120000;

pub fn is_tree_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o40000
}

pub fn is_file_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o100000
}

pub fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

/// One child reference inside a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: Vec<u8>,
    pub id: ObjectId,
}

/// Sort key for canonical tree order: names compare byte-lexically,
/// with directory names compared as if suffixed by `/`. Reordering
/// entries changes every tree ID.
pub fn entry_sort_key(name: &[u8], mode: u32) -> Vec<u8> {
    let mut key = name.to_vec();
    if is_tree_mode(mode) {
        key.push(b'/');
    }
    key
}

/// Sort entries into canonical order.
pub fn canonical_sort(entries: &mut [TreeEntry]) {
    entries.sort_by(|a, b| entry_sort_key(&a.name, a.mode).cmp(&entry_sort_key(&b.name, b.mode)));
}

/// Serialize a tree object: `<octal mode> <name>\0<20-byte id>` per
/// entry, in canonical order.
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    debug_assert!(
        entries
            .windows(2)
            .all(|w| entry_sort_key(&w[0].name, w[0].mode) < entry_sort_key(&w[1].name, w[1].mode)),
        "tree entries must be in canonical order without duplicates"
    );
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(format!("{:o} ", entry.mode).as_bytes());
        out.extend_from_slice(&entry.name);
        out.push(0);
        out.extend_from_slice(entry.id.as_bytes());
    }
    out
}

pub fn decode_tree(bytes: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let space = bytes[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| CairnError::InvalidFormat("tree entry missing mode".into()))?
            + pos;
        let mode_str = std::str::from_utf8(&bytes[pos..space])
            .map_err(|_| CairnError::InvalidFormat("tree mode is not ASCII".into()))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| CairnError::InvalidFormat(format!("bad tree mode '{mode_str}'")))?;

        let nul = bytes[space + 1..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CairnError::InvalidFormat("tree entry missing name terminator".into()))?
            + space
            + 1;
        let name = bytes[space + 1..nul].to_vec();
        if name.is_empty() {
            return Err(CairnError::InvalidFormat("tree entry has empty name".into()));
        }

        let id_end = nul + 1 + 20;
        if id_end > bytes.len() {
            return Err(CairnError::InvalidFormat("tree entry truncated".into()));
        }
        let raw: [u8; 20] = bytes[nul + 1..id_end].try_into().expect("20 bytes");
        entries.push(TreeEntry {
            mode,
            name,
            id: ObjectId(raw),
        });
        pos = id_end;
    }
    Ok(entries)
}

/// Adjust an entry name so readers can distinguish stored
/// representations from user names: a regular file stored as a split
/// tree gains `.bup`; names that would collide with that convention
/// gain `.bupl`.
pub fn mangle_name(name: &[u8], mode: u32, gitmode: u32) -> Vec<u8> {
    let mut out = name.to_vec();
    if is_file_mode(mode) && is_tree_mode(gitmode) {
        out.extend_from_slice(b".bup");
    } else if name.ends_with(b".bup")
        || (!name.is_empty() && name[..name.len() - 1].ends_with(b".bup"))
    {
        out.extend_from_slice(b".bupl");
    }
    out
}

/// Author or committer identity on a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdent {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub when: i64,
}

impl CommitIdent {
    fn encode(&self) -> String {
        format!("{} <{}> {} +0000", self.name, self.email, self.when)
    }

    fn parse(raw: &str) -> Result<Self> {
        let open = raw
            .find('<')
            .ok_or_else(|| CairnError::InvalidFormat("commit ident missing '<'".into()))?;
        let close = raw
            .find('>')
            .ok_or_else(|| CairnError::InvalidFormat("commit ident missing '>'".into()))?;
        let name = raw[..open].trim().to_string();
        let email = raw[open + 1..close].to_string();
        let rest = raw[close + 1..].trim();
        let when = rest
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CairnError::InvalidFormat("commit ident missing timestamp".into()))?;
        Ok(CommitIdent { name, email, when })
    }
}

/// A commit object: a root tree, parent commits, identities, message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: CommitIdent,
    pub committer: CommitIdent,
    pub message: String,
}

pub fn encode_commit(commit: &Commit) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("tree {}\n", commit.tree.to_hex()));
    for parent in &commit.parents {
        out.push_str(&format!("parent {}\n", parent.to_hex()));
    }
    out.push_str(&format!("author {}\n", commit.author.encode()));
    out.push_str(&format!("committer {}\n", commit.committer.encode()));
    out.push('\n');
    out.push_str(&commit.message);
    if !commit.message.ends_with('\n') {
        out.push('\n');
    }
    out.into_bytes()
}

pub fn parse_commit(bytes: &[u8]) -> Result<Commit> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CairnError::InvalidFormat("commit is not UTF-8".into()))?;
    let (header, message) = text
        .split_once("\n\n")
        .ok_or_else(|| CairnError::InvalidFormat("commit missing blank line".into()))?;

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut committer = None;
    for line in header.lines() {
        if let Some(rest) = line.strip_prefix("tree ") {
            tree = Some(ObjectId::from_hex(rest)?);
        } else if let Some(rest) = line.strip_prefix("parent ") {
            parents.push(ObjectId::from_hex(rest)?);
        } else if let Some(rest) = line.strip_prefix("author ") {
            author = Some(CommitIdent::parse(rest)?);
        } else if let Some(rest) = line.strip_prefix("committer ") {
            committer = Some(CommitIdent::parse(rest)?);
        }
    }

    Ok(Commit {
        tree: tree.ok_or_else(|| CairnError::InvalidFormat("commit missing tree".into()))?,
        parents,
        author: author
            .ok_or_else(|| CairnError::InvalidFormat("commit missing author".into()))?,
        committer: committer
            .ok_or_else(|| CairnError::InvalidFormat("commit missing committer".into()))?,
        message: message.to_string(),
    })
}
