//! The two ends of a job
//!
//! A side owns a staging directory of blocks plus the manifest. The source
//! side packs into it; the destination side receives, verifies and unpacks.

mod local;
mod remote;

pub use local::LocalSide;
pub use remote::RemoteSide;

use crate::error::TransferError;
use crate::manifest::Manifest;
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Computes the pending set: manifest blocks that are absent or fail their digest.
pub trait Verifier: Sync {
    fn pending(&self, manifest: &Manifest) -> Result<BTreeSet<String>>;
}

pub trait Side: Verifier {
    /// `local` or the remote target, for messages
    fn label(&self) -> String;

    /// Staging directory holding blocks and manifest.
    fn stage(&self) -> &Path;

    /// Confirm the source exists and is readable; returns the path to pack.
    fn check_source(&self, source: &Path) -> Result<PathBuf, TransferError>;

    /// Create the staging directory; `fresh` discards anything left there.
    fn prepare(&self, fresh: bool) -> Result<()>;

    /// Pack, compress and split `source` into the stage and write its manifest.
    fn pack_and_split(&self, source: &Path, prefix: &str, block_size: u64) -> Result<Manifest>;

    /// Manifest left in the stage by an earlier run, if any.
    fn load_manifest(&self, prefix: &str) -> Result<Option<Manifest>>;

    /// Place the manifest in the stage.
    fn install_manifest(&self, manifest: &Manifest) -> Result<()>;

    /// Concatenate, decompress and unpack the blocks into `dest`.
    fn reassemble(&self, manifest: &Manifest, dest: &Path) -> Result<(), TransferError>;

    /// Remove the stage. Callers treat failures as advisory.
    fn cleanup(&self) -> Result<()>;
}
