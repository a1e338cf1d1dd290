use std::path::PathBuf;

use cairn_types::error::{CairnError, Result};

use crate::split::{DEFAULT_BLOB_BITS, MAX_BLOB_BITS, MIN_BLOB_BITS};

/// Soft ceiling on pack size (`pack.packSizeLimit`).
pub fn default_pack_size_limit() -> u64 {
    1_000_000_000
}

fn default_refsname() -> String {
    "refs".to_string()
}

/// Recognized repository settings with their defaults. Persisted at the
/// `config` storage name in git-config style text and re-parsed on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `pack.compression`: zlib level inside packs.
    pub pack_compression: Option<i32>,
    /// `core.compression`: fallback zlib level.
    pub core_compression: Option<i32>,
    /// `pack.packSizeLimit`: soft pack cap in bytes.
    pub pack_size_limit: u64,
    /// `bup.blobbits`: hashsplit boundary significance.
    pub blob_bits: u32,
    /// `bup.treesplit`: hashsplit directory listings.
    pub treesplit: bool,
    /// `bup.separatemeta`: route tree/commit objects to their own packs.
    pub separatemeta: bool,
    /// `bup.refsname`: ref file basename for concurrent writers.
    pub refsname: String,
    /// `bup.cachedir`: local index cache for encrypted/remote repos.
    pub cachedir: Option<PathBuf>,
    /// `bup.storage`: storage driver selector.
    pub storage: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            pack_compression: None,
            core_compression: None,
            pack_size_limit: default_pack_size_limit(),
            blob_bits: DEFAULT_BLOB_BITS,
            treesplit: false,
            separatemeta: false,
            refsname: default_refsname(),
            cachedir: None,
            storage: None,
        }
    }
}

impl Settings {
    /// Effective zlib level for pack records: `pack.compression`, else
    /// `core.compression`, else −1 for encrypted repositories and 1
    /// otherwise.
    pub fn zlib_level(&self, encrypted: bool) -> i32 {
        self.pack_compression
            .or(self.core_compression)
            .unwrap_or(if encrypted { -1 } else { 1 })
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOB_BITS..=MAX_BLOB_BITS).contains(&self.blob_bits) {
            return Err(CairnError::Config(format!(
                "bup.blobbits must be in {MIN_BLOB_BITS}..={MAX_BLOB_BITS}, got {}",
                self.blob_bits
            )));
        }
        if self.pack_size_limit == 0 {
            return Err(CairnError::Config(
                "pack.packSizeLimit must be positive".into(),
            ));
        }
        if self.refsname.is_empty() || self.refsname.contains('/') {
            return Err(CairnError::Config(format!(
                "bup.refsname must be a bare file name, got '{}'",
                self.refsname
            )));
        }
        if let Some(level) = self.pack_compression.or(self.core_compression) {
            if !(-1..=9).contains(&level) {
                return Err(CairnError::Config(format!(
                    "compression level must be in -1..=9, got {level}"
                )));
            }
        }
        Ok(())
    }

    /// Apply one dotted-key setting. Unrecognized keys are ignored, as
    /// git does with foreign config sections.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "pack.compression" => self.pack_compression = Some(parse_int(key, value)?),
            "core.compression" => self.core_compression = Some(parse_int(key, value)?),
            "pack.packsizelimit" => {
                self.pack_size_limit = parse_int::<u64>(key, value)?;
            }
            "bup.blobbits" => self.blob_bits = parse_int(key, value)?,
            "bup.treesplit" => self.treesplit = parse_bool(key, value)?,
            "bup.separatemeta" => self.separatemeta = parse_bool(key, value)?,
            "bup.refsname" => self.refsname = value.to_string(),
            "bup.cachedir" => self.cachedir = Some(PathBuf::from(value)),
            "bup.storage" => self.storage = Some(value.to_string()),
            _ => tracing::debug!("ignoring unrecognized config key '{key}'"),
        }
        Ok(())
    }

    /// Parse git-config style text: `[section]` headers followed by
    /// `key = value` lines; `#` and `;` start comments.
    pub fn from_config_text(text: &str) -> Result<Settings> {
        let mut settings = Settings::default();
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_ascii_lowercase();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                CairnError::Config(format!("config line {} is not 'key = value'", lineno + 1))
            })?;
            if section.is_empty() {
                return Err(CairnError::Config(format!(
                    "config line {} has no [section]",
                    lineno + 1
                )));
            }
            let dotted = format!("{section}.{}", key.trim().to_ascii_lowercase());
            settings.set(&dotted, value.trim())?;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Render the settings back to config text for persisting at init.
    pub fn to_config_text(&self) -> String {
        let mut out = String::new();
        out.push_str("[pack]\n");
        if let Some(level) = self.pack_compression {
            out.push_str(&format!("\tcompression = {level}\n"));
        }
        out.push_str(&format!("\tpackSizeLimit = {}\n", self.pack_size_limit));
        if let Some(level) = self.core_compression {
            out.push_str("[core]\n");
            out.push_str(&format!("\tcompression = {level}\n"));
        }
        out.push_str("[bup]\n");
        out.push_str(&format!("\tblobbits = {}\n", self.blob_bits));
        out.push_str(&format!("\ttreesplit = {}\n", self.treesplit));
        out.push_str(&format!("\tseparatemeta = {}\n", self.separatemeta));
        out.push_str(&format!("\trefsname = {}\n", self.refsname));
        if let Some(dir) = &self.cachedir {
            out.push_str(&format!("\tcachedir = {}\n", dir.display()));
        }
        if let Some(driver) = &self.storage {
            out.push_str(&format!("\tstorage = {driver}\n"));
        }
        out
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CairnError::Config(format!("bad integer for {key}: '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(CairnError::Config(format!(
            "bad boolean for {key}: '{value}'"
        ))),
    }
}
