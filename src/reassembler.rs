//! Reassembly: ordered concatenation, decompression and unpacking

use crate::codec::Codec;
use crate::error::TransferError;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::session::shell_quote;
use anyhow::Context;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Archive;

/// Reader over block files in manifest order, as one continuous stream.
pub struct BlockChain {
    dir: PathBuf,
    pending: VecDeque<String>,
    current: Option<BufReader<File>>,
}

impl BlockChain {
    pub fn new(dir: &Path, manifest: &Manifest) -> Self {
        Self {
            dir: dir.to_path_buf(),
            pending: manifest.names().map(str::to_string).collect(),
            current: None,
        }
    }
}

impl Read for BlockChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }
            match self.pending.pop_front() {
                Some(name) => {
                    let file = File::open(self.dir.join(&name)).map_err(|e| {
                        io::Error::new(e.kind(), format!("open block {name}: {e}"))
                    })?;
                    self.current = Some(BufReader::with_capacity(1024 * 1024, file));
                }
                None => return Ok(0),
            }
        }
    }
}

/// Rebuild the object from blocks in `stage` and unpack it under `dest`.
///
/// Blocks are deleted once the archive has been fully consumed.
pub fn reassemble_local(
    stage: &Path,
    manifest: &Manifest,
    codec: &Codec,
    dest: &Path,
) -> Result<(), TransferError> {
    let run = || -> anyhow::Result<()> {
        fs::create_dir_all(dest)
            .with_context(|| format!("create destination {}", dest.display()))?;
        let stream = codec.decompressor(BlockChain::new(stage, manifest))?;
        let mut archive = Archive::new(stream);
        archive.set_overwrite(true);
        archive.set_preserve_mtime(true);
        archive
            .unpack(dest)
            .with_context(|| format!("unpack into {}", dest.display()))?;
        // reading to the end makes the decoder check the gzip trailer
        let mut rest = archive.into_inner();
        io::copy(&mut rest, &mut io::sink()).context("read past end of archive")?;
        Ok(())
    };
    run().map_err(|e| TransferError::Reassembly(format!("{e:#}")))?;

    for name in manifest.names() {
        let _ = fs::remove_file(stage.join(name));
    }
    Ok(())
}

/// Shell pipeline that does the same on a remote host. Block order comes
/// from the manifest, not from a glob, so stale files cannot slip in.
pub fn remote_reassemble_script(stage: &Path, dest: &Path, decompress: &str) -> String {
    let stage = shell_quote(&stage.display().to_string());
    let dest = shell_quote(&dest.display().to_string());
    format!(
        "mkdir -p {dest} && cd {stage} && awk '{{print $2}}' {manifest} | xargs cat | {decompress} -dc | tar -xf - -C {dest}",
        manifest = MANIFEST_FILE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestKind;
    use crate::packer::pack_into_blocks;
    use crate::splitter::{build_manifest, BlockWriter};

    fn staged_tree(dir: &Path, block_size: u64) -> (PathBuf, Manifest) {
        let src = dir.join("docs");
        fs::create_dir_all(src.join("nested")).unwrap();
        let big: Vec<u8> = (0..150_000u32).map(|i| (i.wrapping_mul(40503) >> 7) as u8).collect();
        fs::write(src.join("nested/big.bin"), &big).unwrap();
        fs::write(src.join("readme"), b"read me").unwrap();
        fs::write(src.join("empty"), b"").unwrap();

        let stage = dir.join("stage");
        let codec = Codec::Builtin { level: 6 };
        let out = pack_into_blocks(
            &src,
            None,
            &codec,
            BlockWriter::new(&stage, "docs.blk.", block_size).unwrap(),
        )
        .unwrap();
        let manifest = build_manifest(&stage, "docs.blk.", out.blocks, DigestKind::Sha256).unwrap();
        (stage, manifest)
    }

    #[test]
    fn chain_reads_blocks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let m = Manifest::from_digests("c.", vec!["00".into(), "00".into(), "00".into()]).unwrap();
        fs::write(dir.path().join("c.000000"), b"ab").unwrap();
        fs::write(dir.path().join("c.000001"), b"").unwrap();
        fs::write(dir.path().join("c.000002"), b"cde").unwrap();
        let mut out = String::new();
        BlockChain::new(dir.path(), &m).read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcde");
    }

    #[test]
    fn reassembles_tree_and_consumes_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (stage, manifest) = staged_tree(dir.path(), 8 * 1024);
        let dest = dir.path().join("out");
        reassemble_local(&stage, &manifest, &Codec::Builtin { level: 6 }, &dest).unwrap();

        assert_eq!(fs::read(dest.join("docs/readme")).unwrap(), b"read me");
        assert_eq!(fs::read(dest.join("docs/empty")).unwrap().len(), 0);
        assert_eq!(
            fs::read(dest.join("docs/nested/big.bin")).unwrap(),
            fs::read(dir.path().join("docs/nested/big.bin")).unwrap()
        );
        assert!(manifest.names().all(|n| !stage.join(n).exists()));
    }

    #[test]
    fn corrupted_block_is_reassembly_error() {
        let dir = tempfile::tempdir().unwrap();
        let (stage, manifest) = staged_tree(dir.path(), 8 * 1024);
        // truncate the last block; per-block checks are bypassed on purpose
        let last = stage.join(manifest.entries().last().unwrap().name.clone());
        let len = fs::metadata(&last).unwrap().len();
        let f = fs::OpenOptions::new().write(true).open(&last).unwrap();
        f.set_len(len / 2).unwrap();

        let err = reassemble_local(
            &stage,
            &manifest,
            &Codec::Builtin { level: 6 },
            &dir.path().join("out"),
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Reassembly(_)));
    }

    #[test]
    fn remote_script_orders_by_manifest() {
        let script = remote_reassemble_script(
            Path::new("/tmp/blockhop-staging"),
            Path::new("/srv/my data"),
            "pigz",
        );
        assert!(script.starts_with("mkdir -p '/srv/my data' && cd /tmp/blockhop-staging"));
        assert!(script.contains("awk '{print $2}' blockhop.manifest | xargs cat | pigz -dc"));
        assert!(script.ends_with("tar -xf - -C '/srv/my data'"));
    }
}
