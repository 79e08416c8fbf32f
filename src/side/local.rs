use super::{Side, Verifier};
use crate::codec::Codec;
use crate::digest::DigestKind;
use crate::error::TransferError;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::packer::pack_into_blocks;
use crate::reassembler::reassemble_local;
use crate::source;
use crate::splitter::{build_manifest, BlockWriter};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Side living on this machine, under the local work directory.
pub struct LocalSide {
    stage: PathBuf,
    codec: Codec,
    digest: DigestKind,
}

impl LocalSide {
    pub fn new(stage: PathBuf, codec: Codec, digest: DigestKind) -> Self {
        Self {
            stage,
            codec,
            digest,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.stage.join(MANIFEST_FILE)
    }

    /// Work dir shared by both local stages and the journal.
    fn work_dir(&self) -> &Path {
        self.stage.parent().unwrap_or(&self.stage)
    }
}

impl Verifier for LocalSide {
    fn pending(&self, manifest: &Manifest) -> Result<BTreeSet<String>> {
        let mut pending = BTreeSet::new();
        for entry in manifest.entries() {
            let path = self.stage.join(&entry.name);
            let intact = path.is_file()
                && self
                    .digest
                    .digest_file(&path)
                    .map(|d| d == entry.digest)
                    .unwrap_or(false);
            if !intact {
                pending.insert(entry.name.clone());
            }
        }
        Ok(pending)
    }
}

impl Side for LocalSide {
    fn label(&self) -> String {
        "local".to_string()
    }

    fn stage(&self) -> &Path {
        &self.stage
    }

    fn check_source(&self, source: &Path) -> Result<PathBuf, TransferError> {
        // the full readability walk already ran before any staging
        source::check_exists(source)?;
        source::nested_work_dir(source, self.work_dir())?;
        Ok(source.to_path_buf())
    }

    fn prepare(&self, fresh: bool) -> Result<()> {
        if fresh && self.stage.exists() {
            fs::remove_dir_all(&self.stage)
                .with_context(|| format!("clear stale staging {}", self.stage.display()))?;
        }
        fs::create_dir_all(&self.stage)
            .with_context(|| format!("create staging {}", self.stage.display()))
    }

    fn pack_and_split(&self, source: &Path, prefix: &str, block_size: u64) -> Result<Manifest> {
        let skip = source::nested_work_dir(source, self.work_dir())?;
        let writer = BlockWriter::new(&self.stage, prefix, block_size)?;
        let out = pack_into_blocks(source, skip.as_deref(), &self.codec, writer)?;
        let manifest = build_manifest(&self.stage, prefix, out.blocks, self.digest)?;
        manifest.write_to(&self.manifest_path())?;
        Ok(manifest)
    }

    fn load_manifest(&self, prefix: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(None);
        }
        Manifest::read_from(prefix, self.digest, &path).map(Some)
    }

    fn install_manifest(&self, manifest: &Manifest) -> Result<()> {
        fs::create_dir_all(&self.stage)?;
        manifest.write_to(&self.manifest_path())
    }

    fn reassemble(&self, manifest: &Manifest, dest: &Path) -> Result<(), TransferError> {
        reassemble_local(&self.stage, manifest, &self.codec, dest)
    }

    fn cleanup(&self) -> Result<()> {
        if self.stage.exists() {
            fs::remove_dir_all(&self.stage)
                .with_context(|| format!("remove staging {}", self.stage.display()))?;
        }
        // drop the shared work dir once both stages are gone
        if let Some(parent) = self.stage.parent() {
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(dir: &Path) -> LocalSide {
        LocalSide::new(
            dir.join("work/outgoing"),
            Codec::Builtin { level: 6 },
            DigestKind::Sha256,
        )
    }

    fn source(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(&src).unwrap();
        let mut x = 3u32;
        let bytes: Vec<u8> = (0..120_000)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (x >> 16) as u8
            })
            .collect();
        fs::write(src.join("a.bin"), bytes).unwrap();
        src
    }

    #[test]
    fn freshly_split_stage_has_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let side = side(dir.path());
        side.prepare(true).unwrap();
        let m = side.pack_and_split(&source(dir.path()), "src.blk.", 10_000).unwrap();
        assert!(m.len() > 1);
        assert!(side.pending(&m).unwrap().is_empty());
        assert_eq!(side.load_manifest("src.blk.").unwrap(), Some(m));
    }

    #[test]
    fn corrupt_and_missing_blocks_are_pending() {
        let dir = tempfile::tempdir().unwrap();
        let side = side(dir.path());
        side.prepare(true).unwrap();
        let m = side.pack_and_split(&source(dir.path()), "src.blk.", 10_000).unwrap();

        let first = &m.entries()[0].name;
        let mut bytes = fs::read(side.stage().join(first)).unwrap();
        bytes[0] ^= 0xff;
        fs::write(side.stage().join(first), bytes).unwrap();
        let second = &m.entries()[1].name;
        fs::remove_file(side.stage().join(second)).unwrap();

        let pending = side.pending(&m).unwrap();
        let expected: BTreeSet<String> = [first.clone(), second.clone()].into_iter().collect();
        assert_eq!(pending, expected);
        // verifying again without changes gives the same answer
        assert_eq!(side.pending(&m).unwrap(), expected);
    }

    #[test]
    fn cleanup_removes_stage_and_empty_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let side = side(dir.path());
        side.prepare(true).unwrap();
        fs::write(side.stage().join("leftover"), b"x").unwrap();
        side.cleanup().unwrap();
        assert!(!dir.path().join("work").exists());
    }

    #[test]
    fn prepare_fresh_discards_stale_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let side = side(dir.path());
        side.prepare(true).unwrap();
        fs::write(side.stage().join("src.blk.000009"), b"stale").unwrap();
        side.prepare(false).unwrap();
        assert!(side.stage().join("src.blk.000009").exists());
        side.prepare(true).unwrap();
        assert!(!side.stage().join("src.blk.000009").exists());
    }
}
