//! Archive packing: tar the source, compress, and feed the block writer

use crate::codec::Codec;
use crate::splitter::{BlockWriter, SplitOutput};
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::Builder;
use walkdir::WalkDir;

/// Name the source gets inside the archive (and therefore under the destination).
pub fn archive_root(source: &Path) -> Result<PathBuf> {
    let canonical;
    let name = match source.file_name() {
        Some(name) => name,
        None => {
            // `.` or `..` style sources take the resolved directory's name
            canonical = source
                .canonicalize()
                .with_context(|| format!("resolve {}", source.display()))?;
            canonical
                .file_name()
                .ok_or_else(|| anyhow!("cannot archive filesystem root {}", source.display()))?
        }
    };
    Ok(PathBuf::from(name))
}

/// Write a tar of `source` into `sink`, entries rooted at the source's base name.
///
/// Entries are added in sorted order so repacking an unchanged tree yields the
/// same archive. `skip` and everything under it is left out.
pub fn archive<W: Write>(source: &Path, sink: W, skip: Option<&Path>) -> Result<W> {
    let root = archive_root(source)?;
    let mut builder = Builder::new(sink);
    builder.follow_symlinks(false);

    let walk = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| Some(e.path()) != skip);
    for entry in walk {
        let entry = entry.with_context(|| format!("walk {}", source.display()))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let name = if rel.as_os_str().is_empty() {
            root.clone()
        } else {
            root.join(rel)
        };
        builder
            .append_path_with_name(entry.path(), &name)
            .with_context(|| format!("archive {}", entry.path().display()))?;
    }

    builder.into_inner().context("finish archive")
}

/// Pack, compress and split `source` into blocks held by `writer`.
pub fn pack_into_blocks(
    source: &Path,
    skip: Option<&Path>,
    codec: &Codec,
    writer: BlockWriter,
) -> Result<SplitOutput> {
    let compressor = codec.compressor(writer)?;
    let compressor = archive(source, compressor, skip)?;
    let writer = compressor.finish().context("finish compression")?;
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tar::Archive;

    #[test]
    fn archive_is_rooted_at_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/file.txt"), b"hello").unwrap();
        fs::write(src.join("top.txt"), b"").unwrap();

        let bytes = archive(&src, Vec::new(), None).unwrap();
        let mut names: Vec<String> = Archive::new(&bytes[..])
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let p = e.path().unwrap().to_string_lossy().into_owned();
                p.trim_end_matches('/').to_string()
            })
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["tree", "tree/sub", "tree/sub/file.txt", "tree/top.txt"]
        );
    }

    #[test]
    fn skipped_work_dir_stays_out_of_archive() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("proj");
        fs::create_dir_all(src.join(".blockhop/outgoing")).unwrap();
        fs::write(src.join(".blockhop/journal.jsonl"), b"{}").unwrap();
        fs::write(src.join(".blockhop/outgoing/proj.blk.000000"), b"partial").unwrap();
        fs::write(src.join("a.bin"), b"payload").unwrap();

        let skip = src.join(".blockhop");
        let bytes = archive(&src, Vec::new(), Some(skip.as_path())).unwrap();
        let names: Vec<String> = Archive::new(&bytes[..])
            .entries()
            .unwrap()
            .map(|e| {
                let p = e.unwrap().path().unwrap().to_string_lossy().into_owned();
                p.trim_end_matches('/').to_string()
            })
            .collect();
        assert_eq!(names, vec!["proj", "proj/a.bin"]);
    }

    #[test]
    fn single_file_source_archives_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("note.md");
        fs::write(&f, b"# hi").unwrap();
        let bytes = archive(&f, Vec::new(), None).unwrap();
        let mut archive = Archive::new(&bytes[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("note.md"));
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "# hi");
        assert!(entries.next().is_none());
    }

    #[test]
    fn packed_blocks_respect_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload");
        fs::create_dir_all(&src).unwrap();
        let mut x = 1u32;
        let noise: Vec<u8> = (0..200_000)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (x >> 16) as u8
            })
            .collect();
        fs::write(src.join("noise.bin"), &noise).unwrap();

        let stage = dir.path().join("stage");
        let codec = Codec::Builtin { level: 1 };
        let writer = BlockWriter::new(&stage, "payload.blk.", 16 * 1024).unwrap();
        let out = pack_into_blocks(&src, None, &codec, writer).unwrap();
        assert!(out.blocks > 1);
        assert_eq!(out.blocks, out.bytes.div_ceil(16 * 1024));
    }
}
