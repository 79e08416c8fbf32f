//! Endpoint parsing (`[user@]host:path`) and job validation

use crate::error::{Result, TransferError};
use std::fmt;
use std::path::{Path, PathBuf};

/// ssh destination plus the path on that host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// `user@host` or bare `host`, passed verbatim to ssh.
    pub credential_target: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote(RemoteTarget),
}

impl Endpoint {
    /// Parse a CLI argument. Anything of the form `[user@]host:path` is remote,
    /// everything else (including `C:\...` style drive paths) is local.
    pub fn parse(raw: &str) -> Endpoint {
        let s = raw.trim();
        if let Some((authority, path)) = s.split_once(':') {
            let looks_remote = !authority.is_empty()
                && !authority.contains('/')
                && !authority.contains('\\')
                // single letter before ':' is a drive, not a host
                && !(authority.len() == 1 && authority.chars().all(|c| c.is_ascii_alphabetic()));
            if looks_remote {
                let path = if path.is_empty() { "." } else { path };
                return Endpoint::Remote(RemoteTarget {
                    credential_target: authority.to_string(),
                    path: PathBuf::from(path),
                });
            }
        }
        Endpoint::Local(PathBuf::from(s))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Endpoint::Remote(_))
    }

    pub fn path(&self) -> &Path {
        match self {
            Endpoint::Local(p) => p,
            Endpoint::Remote(r) => &r.path,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(p) => write!(f, "{}", p.display()),
            Endpoint::Remote(r) => write!(f, "{}:{}", r.credential_target, r.path.display()),
        }
    }
}

/// Which way the blocks travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToLocal,
    /// local source, remote destination
    Push,
    /// remote source, local destination
    Pull,
}

/// Validated, immutable description of one invocation.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub block_size: u64,
    pub jobs: usize,
    pub rounds: u32,
}

impl TransferJob {
    pub fn new(
        source: Endpoint,
        destination: Endpoint,
        block_size: u64,
        jobs: usize,
        rounds: u32,
    ) -> Result<Self> {
        if source.is_remote() && destination.is_remote() {
            return Err(TransferError::Endpoint(format!(
                "remote-to-remote transfers are not supported ({} -> {})",
                source, destination
            )));
        }
        if block_size == 0 {
            return Err(TransferError::Usage("block size must be at least 1 MB".into()));
        }
        if jobs == 0 {
            return Err(TransferError::Usage("parallel jobs must be at least 1".into()));
        }
        if rounds == 0 {
            return Err(TransferError::Usage("rounds must be at least 1".into()));
        }
        Ok(Self {
            source,
            destination,
            block_size,
            jobs,
            rounds,
        })
    }

    pub fn direction(&self) -> Direction {
        match (&self.source, &self.destination) {
            (Endpoint::Remote(_), _) => Direction::Pull,
            (_, Endpoint::Remote(_)) => Direction::Push,
            _ => Direction::LocalToLocal,
        }
    }

    /// The single remote side, if any.
    pub fn remote(&self) -> Option<&RemoteTarget> {
        match (&self.source, &self.destination) {
            (Endpoint::Remote(r), _) | (_, Endpoint::Remote(r)) => Some(r),
            _ => None,
        }
    }
}
