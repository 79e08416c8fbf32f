//! Block digest algorithms

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Available digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    /// Matches `sha256sum` on the remote side
    #[default]
    Sha256,
    /// Matches `b3sum` on the remote side
    Blake3,
}

impl DigestKind {
    /// Tool that reads and checks `digest  name` manifests on a remote host.
    pub fn remote_tool(self) -> &'static str {
        match self {
            DigestKind::Sha256 => "sha256sum",
            DigestKind::Blake3 => "b3sum",
        }
    }

    /// Hex length of a digest token; used to reject malformed manifest lines.
    pub fn hex_len(self) -> usize {
        64
    }

    pub fn digest_bytes(self, data: &[u8]) -> String {
        match self {
            DigestKind::Sha256 => hex::encode(Sha256::digest(data)),
            DigestKind::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    /// Streamed digest of a file.
    pub fn digest_file(self, path: &Path) -> Result<String> {
        let mut file =
            File::open(path).with_context(|| format!("open {} for digest", path.display()))?;
        let mut buffer = vec![0u8; 256 * 1024];
        match self {
            DigestKind::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            DigestKind::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                loop {
                    let n = file.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                Ok(hasher.finalize().to_hex().to_string())
            }
        }
    }
}
