//! Fixed-size block splitting and manifest construction

use crate::digest::DigestKind;
use crate::manifest::{block_name, Manifest};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Result of cutting a stream into blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOutput {
    pub blocks: u64,
    pub bytes: u64,
}

/// Writer that rolls over to a new block file every `block_size` bytes.
///
/// Block files are opened lazily, so the block count is always
/// `ceil(bytes / block_size)`.
pub struct BlockWriter {
    dir: PathBuf,
    prefix: String,
    block_size: u64,
    current: Option<BufWriter<File>>,
    in_block: u64,
    blocks: u64,
    bytes: u64,
}

impl BlockWriter {
    pub fn new(dir: &Path, prefix: &str, block_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create staging directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            block_size,
            current: None,
            in_block: 0,
            blocks: 0,
            bytes: 0,
        })
    }

    fn open_next(&mut self) -> io::Result<()> {
        // an index the name width cannot hold would break ordering; refuse it
        let name = block_name(&self.prefix, self.blocks).map_err(io::Error::other)?;
        let file = File::create(self.dir.join(name))?;
        self.current = Some(BufWriter::with_capacity(1024 * 1024, file));
        self.in_block = 0;
        self.blocks += 1;
        Ok(())
    }

    fn close_current(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.current.take() {
            w.flush()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<SplitOutput> {
        self.close_current()?;
        Ok(SplitOutput {
            blocks: self.blocks,
            bytes: self.bytes,
        })
    }
}

impl Write for BlockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.in_block == self.block_size {
            self.close_current()?;
            self.open_next()?;
        }
        let room = (self.block_size - self.in_block) as usize;
        let n = buf.len().min(room);
        let written = match self.current.as_mut() {
            Some(w) => w.write(&buf[..n])?,
            None => return Err(io::Error::other("block writer has no open block")),
        };
        self.in_block += written as u64;
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Digest every block as it sits on disk and build the manifest in block order.
pub fn build_manifest(
    dir: &Path,
    prefix: &str,
    blocks: u64,
    digest: DigestKind,
) -> Result<Manifest> {
    let mut digests = Vec::with_capacity(blocks as usize);
    for index in 0..blocks {
        let name = block_name(prefix, index)?;
        digests.push(digest.digest_file(&dir.join(&name))?);
    }
    Manifest::from_digests(prefix, digests)
}
