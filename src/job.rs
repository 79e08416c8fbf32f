//! One transfer from start to cleanup
//!
//! `run` does the local pre-flight, opens the ssh session when an endpoint is
//! remote and hands over to `run_over`, which wires the two sides and drives
//! pack → split → rounds → reassemble. Staging is removed on every exit path,
//! including unwinding, unless the caller asked to keep it after a failure.

use crate::codec::Codec;
use crate::config::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_REMOTE_TMP};
use crate::digest::DigestKind;
use crate::endpoint::{Direction, Endpoint, TransferJob};
use crate::error::TransferError;
use crate::journal::{JobJournal, JobStatus, JournalEntry};
use crate::logger::Logger;
use crate::manifest::{prefix_for, Manifest, BLOCK_CAPACITY};
use crate::mover::{BlockMover, LocalCopy, SessionCopy};
use crate::packer::archive_root;
use crate::progress::TransferProgress;
use crate::scheduler::Scheduler;
use crate::session::{check_local_tools, CopyDirection, SessionChannel, SshSession};
use crate::side::{LocalSide, RemoteSide, Side, Verifier};
use crate::source;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Everything about a job that is not the job itself.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Local staging root; blocks live in `outgoing/` and `incoming/` below it
    pub work_dir: PathBuf,
    /// Staging directory on the remote host
    pub remote_tmp: PathBuf,
    pub digest: DigestKind,
    pub compression_level: u32,
    pub allow_external_compressor: bool,
    pub ssh_options: Vec<String>,
    pub keep_on_failure: bool,
    pub resume: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".blockhop"),
            remote_tmp: PathBuf::from(DEFAULT_REMOTE_TMP),
            digest: DigestKind::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            allow_external_compressor: true,
            ssh_options: Vec::new(),
            keep_on_failure: false,
            resume: false,
            verbose: false,
            quiet: true,
        }
    }
}

/// Statistics reported after a successful job
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: String,
    pub blocks: usize,
    pub block_size: u64,
    /// Block count times block size, not the size of the unpacked object
    pub bytes_moved: u64,
    pub rounds: u32,
    pub copies: u64,
    /// Measured from the first block copy dispatch
    pub elapsed: Duration,
    /// Blocks came from a kept staging area instead of a fresh pack
    pub resumed: bool,
}

impl JobSummary {
    pub fn throughput_mb_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_moved as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Check everything that can be checked without touching the network, open
/// the session if one is needed, run the job and close the session.
pub fn run(
    job: &TransferJob,
    opts: &JobOptions,
    logger: &dyn Logger,
    cancel: &AtomicBool,
) -> Result<JobSummary, TransferError> {
    preflight(job, opts, logger)?;
    let Some(remote) = job.remote() else {
        return run_over(job, opts, None, logger, cancel);
    };

    logger.phase("connect", &format!("target={}", remote.credential_target));
    let session = SshSession::open(&remote.credential_target, &opts.ssh_options)?;
    let result = run_over(job, opts, Some(&session), logger, cancel);
    if let Err(e) = session.close() {
        logger.warning("session-close", &format!("{e:#}"));
        eprintln!("warning: closing ssh session failed: {e:#}");
    }
    result
}

fn preflight(job: &TransferJob, opts: &JobOptions, logger: &dyn Logger) -> Result<(), TransferError> {
    check_work_dir(&opts.work_dir, &JobJournal::new(&opts.work_dir))?;
    if job.remote().is_some() {
        check_local_tools()?;
    }
    if let Endpoint::Local(path) = &job.source {
        let skip = source::nested_work_dir(path, &opts.work_dir)?;
        let summary = source::summarize(path, skip.as_deref())?;
        logger.phase(
            "source",
            &format!(
                "files={} dirs={} bytes={}",
                summary.files, summary.dirs, summary.bytes
            ),
        );
        let blocks = source::minimum_blocks(&summary, job.block_size);
        if blocks > BLOCK_CAPACITY {
            return Err(TransferError::TooManyBlocks {
                blocks,
                capacity: BLOCK_CAPACITY,
            });
        }
    }
    Ok(())
}

/// A work dir is either absent, empty, or one a previous job left with its
/// journal. Anything else belongs to someone else and is never cleared.
fn check_work_dir(work_dir: &Path, journal: &JobJournal) -> Result<(), TransferError> {
    let mut entries = match std::fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(TransferError::Usage(format!(
                "work dir {} is not usable: {e}",
                work_dir.display()
            )))
        }
    };
    if entries.next().is_none() || journal.exists() {
        return Ok(());
    }
    Err(TransferError::Usage(format!(
        "work dir {} is not empty and was not created by blockhop; pass an empty --work-dir",
        work_dir.display()
    )))
}

/// Run a job over an already open channel (`None` for local-to-local).
pub fn run_over<'a>(
    job: &'a TransferJob,
    opts: &'a JobOptions,
    channel: Option<&'a dyn SessionChannel>,
    logger: &'a dyn Logger,
    cancel: &'a AtomicBool,
) -> Result<JobSummary, TransferError> {
    let journal = JobJournal::new(&opts.work_dir);
    check_work_dir(&opts.work_dir, &journal)?;
    let id = uuid::Uuid::new_v4().to_string();
    let src_label = job.source.to_string();
    let dst_label = job.destination.to_string();
    logger.job_start(&id, &src_label, &dst_label, job.block_size, job.jobs);

    let resume = opts.resume && resumable(&journal, &src_label, &dst_label, job.block_size, logger);
    if opts.resume && !resume && !opts.quiet {
        eprintln!("note: no kept staging for this transfer, starting fresh");
    }
    record(
        &journal,
        &JournalEntry::new(&id, &src_label, &dst_label, job.block_size, JobStatus::InProgress),
        logger,
    );

    let result = JobContext::wire(id.clone(), job, opts, channel, logger, cancel).and_then(|ctx| {
        let mut guard = StageCleanup {
            sides: [ctx.source.as_ref(), ctx.destination.as_ref()],
            logger,
            keep: false,
        };
        let result = ctx.execute(resume);
        guard.keep = result.is_err() && opts.keep_on_failure;
        match &result {
            Ok(_) => ctx.progress.finish("done"),
            Err(_) => ctx.progress.abandon("failed"),
        }
        drop(guard);
        result
    });

    let kept = result.is_err() && opts.keep_on_failure;
    let mut entry = JournalEntry::new(
        &id,
        &src_label,
        &dst_label,
        job.block_size,
        match &result {
            Ok(_) => JobStatus::Completed,
            Err(TransferError::Interrupted) => JobStatus::Interrupted,
            Err(_) => JobStatus::Failed,
        },
    );
    entry.staging_kept = kept;
    match &result {
        Ok(summary) => {
            entry.blocks = Some(summary.blocks);
            logger.done(
                summary.blocks as u64,
                summary.bytes_moved,
                summary.elapsed.as_secs_f64(),
            );
        }
        Err(e) => {
            entry.error = Some(e.to_string());
            logger.error(e.kind(), &e.to_string());
        }
    }
    record(&journal, &entry, logger);
    if !kept {
        // nothing left to resume; leave no work dir behind
        if let Err(e) = journal.remove() {
            logger.warning("journal", &format!("{e:#}"));
        }
        let _ = std::fs::remove_dir(&opts.work_dir);
    }
    result
}

fn resumable(journal: &JobJournal, source: &str, dest: &str, block_size: u64, logger: &dyn Logger) -> bool {
    match journal.resumable(source, dest, block_size) {
        Ok(found) => found.is_some(),
        Err(e) => {
            logger.warning("journal", &format!("{e:#}"));
            false
        }
    }
}

fn record(journal: &JobJournal, entry: &JournalEntry, logger: &dyn Logger) {
    if let Err(e) = journal.add_entry(entry) {
        logger.warning("journal", &format!("{e:#}"));
    }
}

/// Removes both staging areas when dropped.
struct StageCleanup<'s> {
    sides: [&'s dyn Side; 2],
    logger: &'s dyn Logger,
    keep: bool,
}

impl Drop for StageCleanup<'_> {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for side in self.sides {
            if let Err(e) = side.cleanup() {
                let msg = format!("{} staging {}: {e:#}", side.label(), side.stage().display());
                self.logger.warning("cleanup", &msg);
                eprintln!("warning: cleanup of {msg}");
            }
        }
    }
}

/// Per-job state handed to each phase
pub struct JobContext<'a> {
    id: String,
    job: &'a TransferJob,
    opts: &'a JobOptions,
    source: Box<dyn Side + 'a>,
    destination: Box<dyn Side + 'a>,
    mover: Box<dyn BlockMover + 'a>,
    logger: &'a dyn Logger,
    progress: TransferProgress,
    cancel: &'a AtomicBool,
}

impl<'a> JobContext<'a> {
    /// Pick the side and copy implementations for the job's direction.
    fn wire(
        id: String,
        job: &'a TransferJob,
        opts: &'a JobOptions,
        channel: Option<&'a dyn SessionChannel>,
        logger: &'a dyn Logger,
        cancel: &'a AtomicBool,
    ) -> Result<Self, TransferError> {
        let codec = Codec::probe(opts.compression_level, opts.allow_external_compressor);
        logger.phase("codec", &codec.describe());
        let outgoing = opts.work_dir.join("outgoing");
        let incoming = opts.work_dir.join("incoming");

        let direction = job.direction();
        let channel = match (direction, channel) {
            (Direction::LocalToLocal, _) => None,
            (_, Some(c)) => Some(c),
            (_, None) => {
                return Err(TransferError::Other(anyhow::anyhow!(
                    "remote job started without a session"
                )))
            }
        };
        let remote = match channel {
            Some(c) => Some(RemoteSide::connect(
                c,
                opts.remote_tmp.clone(),
                opts.digest,
                opts.compression_level,
            )?),
            None => None,
        };
        if let Some(r) = &remote {
            logger.phase("remote-codec", r.compressor());
        }

        let mut ctx = JobContext {
            id,
            job,
            opts,
            source: Box::new(LocalSide::new(outgoing.clone(), codec.clone(), opts.digest)),
            destination: Box::new(LocalSide::new(incoming.clone(), codec.clone(), opts.digest)),
            mover: Box::new(LocalCopy::new(outgoing.clone(), incoming.clone())),
            logger,
            progress: TransferProgress::new(!opts.quiet),
            cancel,
        };
        match (direction, channel, remote) {
            (Direction::Push, Some(c), Some(r)) => {
                ctx.destination = Box::new(r);
                ctx.mover = Box::new(SessionCopy::new(
                    c,
                    outgoing,
                    opts.remote_tmp.clone(),
                    CopyDirection::Upload,
                ));
            }
            (Direction::Pull, Some(c), Some(r)) => {
                ctx.source = Box::new(r);
                ctx.mover = Box::new(SessionCopy::new(
                    c,
                    incoming,
                    opts.remote_tmp.clone(),
                    CopyDirection::Download,
                ));
            }
            _ => {}
        }
        Ok(ctx)
    }

    fn say(&self, phase: &str, detail: &str) {
        self.logger.phase(phase, detail);
        if self.opts.verbose {
            self.progress.println(&format!("{phase}: {detail}"));
        }
    }

    fn checkpoint(&self) -> Result<(), TransferError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(TransferError::Interrupted);
        }
        Ok(())
    }

    fn block_prefix(&self, resolved: &Path) -> Result<String, TransferError> {
        if self.job.source.is_remote() {
            return Ok(prefix_for(resolved));
        }
        Ok(prefix_for(&archive_root(resolved)?))
    }

    /// Manifest for the source: reused from kept staging when asked and
    /// still intact, otherwise freshly packed. The flag says which.
    fn stage_source(
        &self,
        resolved: &Path,
        prefix: &str,
        resume: bool,
    ) -> Result<(Manifest, bool), TransferError> {
        if resume {
            self.source.prepare(false)?;
            match self.source.load_manifest(prefix) {
                Ok(Some(m)) if self.source.pending(&m)?.is_empty() => {
                    self.say("resume", &format!("reusing {} kept blocks", m.len()));
                    return Ok((m, true));
                }
                Ok(_) => self.say("resume", "kept blocks incomplete, repacking"),
                Err(e) => self
                    .logger
                    .warning("resume", &format!("unreadable kept manifest: {e:#}")),
            }
        }
        self.source.prepare(true)?;
        self.say(
            "pack",
            &format!("{} on {}", resolved.display(), self.source.label()),
        );
        let manifest = self
            .source
            .pack_and_split(resolved, prefix, self.job.block_size)?;
        self.say("split", &format!("{} blocks", manifest.len()));
        Ok((manifest, false))
    }

    fn execute(&self, resume: bool) -> Result<JobSummary, TransferError> {
        let resolved = self.source.check_source(self.job.source.path())?;
        let prefix = self.block_prefix(&resolved)?;
        self.checkpoint()?;

        let (manifest, resumed) = self.stage_source(&resolved, &prefix, resume)?;
        self.checkpoint()?;

        // received blocks only survive when the manifest they belong to did
        self.destination.prepare(!resumed)?;
        self.destination.install_manifest(&manifest)?;

        let report = Scheduler::new(self.job.jobs, self.job.rounds, self.logger, &self.progress)
            .with_cancel(self.cancel)
            .run(&manifest, self.destination.as_ref(), self.mover.as_ref())?;
        self.say(
            "verified",
            &format!("{} blocks after {} rounds", manifest.len(), report.rounds),
        );

        self.checkpoint()?;
        self.say(
            "reassemble",
            &format!(
                "into {} on {}",
                self.job.destination.path().display(),
                self.destination.label()
            ),
        );
        self.destination
            .reassemble(&manifest, self.job.destination.path())?;

        let blocks = manifest.len();
        Ok(JobSummary {
            job_id: self.id.clone(),
            blocks,
            block_size: self.job.block_size,
            bytes_moved: blocks as u64 * self.job.block_size,
            rounds: report.rounds,
            copies: report.copies_dispatched,
            elapsed: report.elapsed,
            resumed,
        })
    }
}
