//! Block naming and the `digest  name` manifest
//!
//! Block names are `<prefix><index>` with a fixed-width, zero-padded index so
//! that lexical order (shell globs, `ls`) equals block order. The manifest
//! file uses the same layout `sha256sum`/`b3sum` print, which lets a remote
//! host check it with `<tool> -c` directly.

use crate::digest::DigestKind;
use crate::error::TransferError;
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Digits in a block index.
pub const INDEX_WIDTH: usize = 6;

/// Number of distinct block names a prefix can carry.
pub const BLOCK_CAPACITY: u64 = 1_000_000;

/// File name of the manifest inside a staging directory.
pub const MANIFEST_FILE: &str = "blockhop.manifest";

/// Name of block `index` under `prefix`; refuses indices the width cannot hold.
pub fn block_name(prefix: &str, index: u64) -> Result<String, TransferError> {
    if index >= BLOCK_CAPACITY {
        return Err(TransferError::TooManyBlocks {
            blocks: index + 1,
            capacity: BLOCK_CAPACITY,
        });
    }
    Ok(format!("{prefix}{index:0width$}", width = INDEX_WIDTH))
}

/// Shared block prefix derived from the source's base name.
pub fn prefix_for(source: &Path) -> String {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let clean: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let clean = clean.trim_start_matches('.');
    let clean = if clean.is_empty() { "root" } else { clean };
    format!("{clean}.blk.")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub digest: String,
}

/// Ordered (block name, digest) list; written once per job and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build from digests listed in block order.
    pub fn from_digests(prefix: &str, digests: Vec<String>) -> Result<Self> {
        let mut entries = Vec::with_capacity(digests.len());
        for (i, digest) in digests.into_iter().enumerate() {
            entries.push(ManifestEntry {
                name: block_name(prefix, i as u64)?,
                digest,
            });
        }
        Ok(Self { entries })
    }

    /// Parse manifest text; every line must name the next block in sequence
    /// and carry a digest of the length `kind` produces.
    pub fn parse(prefix: &str, kind: DigestKind, text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (digest, name) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("manifest line {} is malformed", lineno + 1))?;
            // `*name` marks binary mode in coreutils output
            let name = name.trim_start().trim_start_matches('*');
            let expected = block_name(prefix, entries.len() as u64)?;
            if name != expected {
                bail!(
                    "manifest line {} names {}, expected {}",
                    lineno + 1,
                    name,
                    expected
                );
            }
            if digest.len() != kind.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("manifest line {} has a malformed digest", lineno + 1);
            }
            entries.push(ManifestEntry {
                name: expected,
                digest: digest.to_ascii_lowercase(),
            });
        }
        Ok(Self { entries })
    }

    pub fn read_from(prefix: &str, kind: DigestKind, path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        Self::parse(prefix, kind, &text)
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.entries.len() * 96);
        for e in &self.entries {
            out.push_str(&e.digest);
            out.push_str("  ");
            out.push_str(&e.name);
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)
            .with_context(|| format!("create manifest {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(self.render().as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}
