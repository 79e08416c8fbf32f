//! Defaults file and option resolution
//!
//! Precedence: command line, then config file, then built-in defaults.

use crate::cli::Args;
use crate::digest::DigestKind;
use crate::endpoint::{Endpoint, TransferJob};
use crate::error::TransferError;
use crate::job::JobOptions;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROUNDS: u32 = 10;
pub const DEFAULT_REMOTE_TMP: &str = "/tmp/blockhop-staging";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
const MEGABYTE: u64 = 1024 * 1024;

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub rounds: Option<u32>,
    pub digest: Option<DigestKind>,
    pub work_dir: Option<PathBuf>,
    pub remote_tmp: Option<String>,
    pub compression_level: Option<u32>,
    pub ssh_options: Vec<String>,
    pub no_external_compressor: bool,
}

pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("blockhop");
    }
    PathBuf::from(".blockhop")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Read the named file, or the default one if it exists.
///
/// A missing default file is not an error; a missing explicit one is.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig, TransferError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = default_config_path();
            if !p.is_file() {
                return Ok(FileConfig::default());
            }
            p
        }
    };
    parse_file(&path).map_err(|e| TransferError::Usage(format!("{e:#}")))
}

fn parse_file(path: &Path) -> Result<FileConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: FileConfig =
        toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

/// Merge arguments over the file config into a validated job and its options.
pub fn resolve(args: &Args, file: &FileConfig) -> Result<(TransferJob, JobOptions), TransferError> {
    let block_size = args.block_mb.checked_mul(MEGABYTE).ok_or_else(|| {
        TransferError::Usage(format!("block size {} MB is too large", args.block_mb))
    })?;
    let rounds = args.rounds.or(file.rounds).unwrap_or(DEFAULT_ROUNDS);
    let job = TransferJob::new(
        Endpoint::parse(&args.source),
        Endpoint::parse(&args.destination),
        block_size,
        args.jobs,
        rounds,
    )?;

    let remote_tmp = args
        .remote_tmp
        .clone()
        .or_else(|| file.remote_tmp.clone())
        .unwrap_or_else(|| DEFAULT_REMOTE_TMP.to_string());
    check_remote_tmp(&remote_tmp)?;

    let compression_level = args
        .compression_level
        .or(file.compression_level)
        .unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if !(1..=9).contains(&compression_level) {
        return Err(TransferError::Usage(format!(
            "compression level {compression_level} is outside 1..=9"
        )));
    }

    let work_dir = args
        .work_dir
        .clone()
        .or_else(|| file.work_dir.clone())
        .unwrap_or_else(|| PathBuf::from(".blockhop"));

    let mut ssh_options = file.ssh_options.clone();
    ssh_options.extend(args.ssh_options.iter().cloned());

    let opts = JobOptions {
        work_dir,
        remote_tmp: PathBuf::from(remote_tmp),
        digest: args.digest.or(file.digest).unwrap_or_default(),
        compression_level,
        allow_external_compressor: !(args.no_pigz || file.no_external_compressor),
        ssh_options,
        keep_on_failure: args.keep_on_failure,
        resume: args.resume,
        verbose: args.verbose,
        quiet: args.quiet,
    };
    Ok((job, opts))
}

/// The remote staging dir is interpolated into shell pipelines and removed
/// with `rm -rf`; keep it absolute, plain and away from `/`.
fn check_remote_tmp(dir: &str) -> Result<(), TransferError> {
    let plain = dir
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    let depth = dir.split('/').filter(|s| !s.is_empty()).count();
    if !dir.starts_with('/') || !plain || depth < 2 || dir.split('/').any(|s| s == "..") {
        return Err(TransferError::Usage(format!(
            "remote staging dir {dir:?} must be an absolute path at least two levels deep, \
             made of letters, digits, '.', '_', '-' and '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut v = vec!["blockhop", "src", "host:/dst", "4", "2"];
        v.extend_from_slice(extra);
        Args::parse_from(v)
    }

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let (job, opts) = resolve(&args(&[]), &FileConfig::default()).unwrap();
        assert_eq!(job.block_size, 4 * MEGABYTE);
        assert_eq!(job.rounds, DEFAULT_ROUNDS);
        assert_eq!(opts.digest, DigestKind::Sha256);
        assert_eq!(opts.remote_tmp, PathBuf::from(DEFAULT_REMOTE_TMP));
        assert_eq!(opts.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert!(opts.allow_external_compressor);
    }

    #[test]
    fn flags_override_file_and_file_overrides_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            rounds = 3
            digest = "blake3"
            remote_tmp = "/var/tmp/bh"
            ssh_options = ["Port=2222"]
            no_external_compressor = true
            "#,
        )
        .unwrap();
        let (job, opts) = resolve(&args(&["-r", "7", "-o", "Compression=no"]), &file).unwrap();
        assert_eq!(job.rounds, 7);
        assert_eq!(opts.digest, DigestKind::Blake3);
        assert_eq!(opts.remote_tmp, PathBuf::from("/var/tmp/bh"));
        assert_eq!(opts.ssh_options, vec!["Port=2222", "Compression=no"]);
        assert!(!opts.allow_external_compressor);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("colour = true").is_err());
    }

    #[test]
    fn unsafe_remote_tmp_is_a_usage_error() {
        for bad in ["relative/dir", "/", "/tmp", "/tmp/a b", "/tmp/$(x)", "/tmp/../etc"] {
            let err = resolve(&args(&["--remote-tmp", bad]), &FileConfig::default()).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{bad}");
        }
    }

    #[test]
    fn zero_block_size_and_remote_pair_are_rejected() {
        let zero = Args::parse_from(["blockhop", "a", "b", "0", "1"]);
        assert_eq!(resolve(&zero, &FileConfig::default()).unwrap_err().exit_code(), 2);
        let both = Args::parse_from(["blockhop", "h1:/a", "h2:/b", "1", "1"]);
        assert_eq!(resolve(&both, &FileConfig::default()).unwrap_err().exit_code(), 4);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("nope.toml"))).is_err());
        let p = dir.path().join("c.toml");
        std::fs::write(&p, "rounds = 4\n").unwrap();
        assert_eq!(load(Some(&p)).unwrap().rounds, Some(4));
    }
}
