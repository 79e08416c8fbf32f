//! Source enumeration ahead of packing

use crate::error::TransferError;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Best compression ratio deflate can reach. No gzip stream is smaller than
/// its input divided by this.
const DEFLATE_MAX_RATIO: u64 = 1032;

/// Totals for the object about to be packed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

/// Walk the source and prove every entry is readable, so a bad source fails
/// before anything is staged or any connection is made. `skip` prunes one
/// subtree (the work dir when it sits inside the source).
pub fn summarize(source: &Path, skip: Option<&Path>) -> Result<SourceSummary, TransferError> {
    let meta = check_exists(source)?;

    let mut summary = SourceSummary::default();
    if meta.is_file() {
        check_readable(source)?;
        summary.files = 1;
        summary.bytes = meta.len();
        return Ok(summary);
    }

    let walk = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| Some(e.path()) != skip);
    for entry in walk {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| source.display().to_string());
            TransferError::Endpoint(format!("cannot read {}: {}", path, e))
        })?;
        let ft = entry.file_type();
        if ft.is_dir() {
            summary.dirs += 1;
        } else if ft.is_file() {
            check_readable(entry.path())?;
            summary.files += 1;
            summary.bytes += entry
                .metadata()
                .map(|m| m.len())
                .map_err(|e| TransferError::Endpoint(e.to_string()))?;
        }
        // symlinks are archived as links, nothing to read
    }
    Ok(summary)
}

/// Metadata of the source itself, without following a final symlink.
pub fn check_exists(source: &Path) -> Result<std::fs::Metadata, TransferError> {
    std::fs::symlink_metadata(source).map_err(|e| {
        TransferError::Endpoint(format!("source {} is not accessible: {}", source.display(), e))
    })
}

fn check_readable(path: &Path) -> Result<(), TransferError> {
    File::open(path).map(drop).map_err(|e| {
        TransferError::Endpoint(format!("cannot read {}: {}", path.display(), e))
    })
}

/// Fewest blocks the packed source can occupy. Anything above capacity here
/// overflows no matter how well the data compresses; the block writer has
/// the final word for everything else.
pub fn minimum_blocks(summary: &SourceSummary, block_size: u64) -> u64 {
    summary
        .bytes
        .div_ceil(DEFLATE_MAX_RATIO)
        .div_ceil(block_size)
        .max(1)
}

/// `path` with symlinks resolved as far as it exists, the rest appended.
fn resolve(path: &Path) -> PathBuf {
    let mut head = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        if let Ok(real) = head.canonicalize() {
            return tail.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match head.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                head.pop();
                if head.as_os_str().is_empty() {
                    head.push(".");
                }
            }
            None => return std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
        }
    }
}

/// The work dir as the source walk would reach it, if it lies inside the
/// source. Staging must never end up in its own archive, and a source inside
/// the work dir would be wiped when staging is prepared.
pub fn nested_work_dir(source: &Path, work_dir: &Path) -> Result<Option<PathBuf>, TransferError> {
    let src = resolve(source);
    let work = resolve(work_dir);
    if src.starts_with(&work) {
        return Err(TransferError::Endpoint(format!(
            "source {} lies inside the work dir {}",
            source.display(),
            work_dir.display()
        )));
    }
    Ok(work.strip_prefix(&src).ok().map(|rel| source.join(rel)))
}
