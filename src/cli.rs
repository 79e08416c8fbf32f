//! Command-line surface

use crate::digest::DigestKind;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "blockhop - resumable, verified, parallel block transfer over ssh"
)]
pub struct Args {
    /// Source path, optionally prefixed with a remote identity (user@host:path)
    pub source: String,

    /// Destination directory, optionally prefixed with a remote identity
    pub destination: String,

    /// Block size in megabytes
    pub block_mb: u64,

    /// Number of block copies in flight at once
    pub jobs: usize,

    /// Maximum verify-and-copy rounds before giving up
    #[arg(short = 'r', long)]
    pub rounds: Option<u32>,

    /// Per-block digest algorithm
    #[arg(long, value_enum)]
    pub digest: Option<DigestKind>,

    /// Config file (default: ~/.config/blockhop/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Local staging directory
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Staging directory on the remote host (absolute)
    #[arg(long = "remote-tmp")]
    pub remote_tmp: Option<String>,

    /// Extra ssh option, passed as `-o <OPT>` (repeatable)
    #[arg(short = 'o', long = "ssh-option", action = ArgAction::Append)]
    pub ssh_options: Vec<String>,

    /// gzip compression level
    #[arg(long = "compression-level", value_parser = clap::value_parser!(u32).range(1..=9))]
    pub compression_level: Option<u32>,

    /// Never pipe through pigz locally; use the builtin gzip codec
    #[arg(long = "no-pigz")]
    pub no_pigz: bool,

    /// Leave staging in place after an interrupted or incomplete transfer
    #[arg(long = "keep-on-failure")]
    pub keep_on_failure: bool,

    /// Reuse blocks kept by a previous run of the same transfer
    #[arg(long)]
    pub resume: bool,

    /// Append event log lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Show phases as they run
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// No progress bar, only errors and the final summary
    #[arg(short, long)]
    pub quiet: bool,
}
