//! Single-block copy primitives
//!
//! A copy may be re-issued any number of times for the same block; it always
//! overwrites. Whether it worked is decided by the next verification pass.

use crate::session::{CopyDirection, SessionChannel};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

pub trait BlockMover: Sync {
    fn copy_block(&self, name: &str) -> Result<()>;
}

/// Copy between two staging directories on this machine.
pub struct LocalCopy {
    from: PathBuf,
    to: PathBuf,
    buffer_size: usize,
}

impl LocalCopy {
    pub fn new(from: PathBuf, to: PathBuf) -> Self {
        Self {
            from,
            to,
            buffer_size: 1024 * 1024,
        }
    }
}

impl BlockMover for LocalCopy {
    fn copy_block(&self, name: &str) -> Result<()> {
        let src = self.from.join(name);
        let dst = self.to.join(name);
        // write beside the target and rename, so a reader never sees half a block
        let tmp = self.to.join(format!(".{name}.part"));

        let mut reader = BufReader::with_capacity(
            self.buffer_size,
            File::open(&src).with_context(|| format!("open {}", src.display()))?,
        );
        let mut writer = BufWriter::with_capacity(
            self.buffer_size,
            File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?,
        );
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
        }
        writer.flush()?;
        drop(writer);

        fs::rename(&tmp, &dst)
            .with_context(|| format!("move {} into place", dst.display()))?;
        Ok(())
    }
}

/// Copy through the job's session channel.
pub struct SessionCopy<'a> {
    channel: &'a dyn SessionChannel,
    local_stage: PathBuf,
    remote_stage: PathBuf,
    direction: CopyDirection,
}

impl<'a> SessionCopy<'a> {
    pub fn new(
        channel: &'a dyn SessionChannel,
        local_stage: PathBuf,
        remote_stage: PathBuf,
        direction: CopyDirection,
    ) -> Self {
        Self {
            channel,
            local_stage,
            remote_stage,
            direction,
        }
    }
}

impl BlockMover for SessionCopy<'_> {
    fn copy_block(&self, name: &str) -> Result<()> {
        self.channel.copy_block(
            &self.local_stage.join(name),
            &self.remote_stage.join(name),
            self.direction,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_copy_overwrites_and_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("out");
        let to = dir.path().join("in");
        fs::create_dir_all(&from).unwrap();
        fs::create_dir_all(&to).unwrap();
        fs::write(from.join("b.000001"), vec![7u8; 3_000_000]).unwrap();
        fs::write(to.join("b.000001"), b"garbage").unwrap();

        let mover = LocalCopy::new(from.clone(), to.clone());
        mover.copy_block("b.000001").unwrap();
        mover.copy_block("b.000001").unwrap();
        assert_eq!(fs::read(to.join("b.000001")).unwrap(), vec![7u8; 3_000_000]);
        assert!(!to.join(".b.000001.part").exists());
    }

    #[test]
    fn missing_source_block_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mover = LocalCopy::new(dir.path().join("a"), dir.path().to_path_buf());
        assert!(mover.copy_block("nope").is_err());
    }
}
