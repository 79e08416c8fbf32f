//! Resumable transfer core
//!
//! Each round verifies the destination from scratch, then copies exactly the
//! pending blocks through a pool of `jobs` workers. Individual copy results
//! are only logged: the next round's verification decides what arrived.

use crate::error::TransferError;
use crate::logger::Logger;
use crate::manifest::Manifest;
use crate::mover::BlockMover;
use crate::progress::TransferProgress;
use crate::side::Verifier;
use anyhow::Context;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// What the round loop did
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    /// Rounds that dispatched copies
    pub rounds: u32,
    pub copies_dispatched: u64,
    pub copy_failures: u64,
    /// Blocks pending at the start of the first round
    pub initially_pending: usize,
    /// From the first dispatched copy to confirmed completion
    pub elapsed: Duration,
}

pub struct Scheduler<'a> {
    jobs: usize,
    max_rounds: u32,
    logger: &'a dyn Logger,
    progress: &'a TransferProgress,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        jobs: usize,
        max_rounds: u32,
        logger: &'a dyn Logger,
        progress: &'a TransferProgress,
    ) -> Self {
        Self {
            jobs: jobs.max(1),
            max_rounds: max_rounds.max(1),
            logger,
            progress,
            cancel: None,
        }
    }

    /// Stop dispatching once `flag` is raised.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::SeqCst))
    }

    pub fn run<V, M>(
        &self,
        manifest: &Manifest,
        verifier: &V,
        mover: &M,
    ) -> Result<TransferReport, TransferError>
    where
        V: Verifier + ?Sized,
        M: BlockMover + ?Sized,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("blockhop-copy-{i}"))
            .build()
            .context("build copy worker pool")?;

        let mut report = TransferReport::default();
        let mut first_dispatch: Option<Instant> = None;

        for round in 0..self.max_rounds {
            // verify fully before dispatching anything this round
            let pending = verifier.pending(manifest)?;
            if round == 0 {
                report.initially_pending = pending.len();
            }
            self.logger.round_start(round, pending.len());
            if pending.is_empty() {
                report.elapsed = first_dispatch.map(|t| t.elapsed()).unwrap_or_default();
                return Ok(report);
            }
            if self.cancelled() {
                return Err(TransferError::Interrupted);
            }

            self.progress
                .begin_round(round, self.max_rounds, pending.len());
            first_dispatch.get_or_insert_with(Instant::now);

            let names: Vec<&str> = pending.iter().map(String::as_str).collect();
            let failures = AtomicU64::new(0);
            let dispatched = AtomicU64::new(0);
            pool.install(|| {
                // one block per task: a free worker picks up the next block at once
                names.par_iter().with_max_len(1).for_each(|name| {
                    if self.cancelled() {
                        return;
                    }
                    dispatched.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = mover.copy_block(name) {
                        failures.fetch_add(1, Ordering::Relaxed);
                        self.logger.copy_failed(name, &format!("{e:#}"));
                    }
                    self.progress.block_done();
                });
            });

            report.rounds = round + 1;
            report.copies_dispatched += dispatched.into_inner();
            report.copy_failures += failures.into_inner();
            if self.cancelled() {
                return Err(TransferError::Interrupted);
            }
        }

        // the last round's copies still get judged, but never re-driven
        let pending = verifier.pending(manifest)?;
        self.logger.round_start(self.max_rounds, pending.len());
        if pending.is_empty() {
            report.elapsed = first_dispatch.map(|t| t.elapsed()).unwrap_or_default();
            return Ok(report);
        }
        Err(TransferError::TransferIncomplete {
            missing: pending.len(),
            rounds: self.max_rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// In-memory destination: a block is present once copied, unless it is
    /// listed as permanently lost or as failing a number of attempts first.
    #[derive(Default)]
    struct FakeDest {
        present: Mutex<HashSet<String>>,
        lost: HashSet<String>,
        flaky: Mutex<HashMap<String, u32>>,
        copies: Mutex<HashMap<String, u32>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        verifications: AtomicUsize,
    }

    impl Verifier for FakeDest {
        fn pending(&self, manifest: &Manifest) -> anyhow::Result<BTreeSet<String>> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            let present = self.present.lock();
            Ok(manifest
                .names()
                .filter(|n| !present.contains(*n))
                .map(str::to_string)
                .collect())
        }
    }

    impl BlockMover for FakeDest {
        fn copy_block(&self, name: &str) -> anyhow::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            *self.copies.lock().entry(name.to_string()).or_default() += 1;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.lost.contains(name) {
                anyhow::bail!("connection reset");
            }
            let mut flaky = self.flaky.lock();
            if let Some(left) = flaky.get_mut(name) {
                if *left > 0 {
                    *left -= 1;
                    // report success but leave nothing behind
                    return Ok(());
                }
            }
            self.present.lock().insert(name.to_string());
            Ok(())
        }
    }

    fn manifest(n: usize) -> Manifest {
        Manifest::from_digests("t.", (0..n).map(|i| format!("{i:064x}")).collect()).unwrap()
    }

    fn scheduler<'a>(
        jobs: usize,
        rounds: u32,
        logger: &'a NoopLogger,
        progress: &'a TransferProgress,
    ) -> Scheduler<'a> {
        Scheduler::new(jobs, rounds, logger, progress)
    }

    #[test]
    fn completes_in_one_round_when_copies_land() {
        let dest = FakeDest::default();
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        let report = scheduler(4, 3, &logger, &progress)
            .run(&manifest(20), &dest, &dest)
            .unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(report.copies_dispatched, 20);
        assert_eq!(report.initially_pending, 20);
        // round 0 verify + round 1 verify
        assert_eq!(dest.verifications.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn resumed_job_copies_only_the_deficit() {
        let m = manifest(10);
        let dest = FakeDest::default();
        for name in m.names().take(6) {
            dest.present.lock().insert(name.to_string());
        }
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        let report = scheduler(3, 5, &logger, &progress)
            .run(&m, &dest, &dest)
            .unwrap();
        assert_eq!(report.initially_pending, 4);
        assert_eq!(report.copies_dispatched, 4);
        let copies = dest.copies.lock();
        assert!(m.names().take(6).all(|n| !copies.contains_key(n)));
    }

    #[test]
    fn permanently_lost_block_fails_after_exactly_max_rounds() {
        let m = manifest(5);
        let lost = m.entries()[2].name.clone();
        let dest = FakeDest {
            lost: [lost.clone()].into_iter().collect(),
            ..Default::default()
        };
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        let err = scheduler(2, 4, &logger, &progress)
            .run(&m, &dest, &dest)
            .unwrap_err();
        match err {
            TransferError::TransferIncomplete { missing, rounds } => {
                assert_eq!(missing, 1);
                assert_eq!(rounds, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dest.copies.lock()[&lost], 4);
        // every other block was copied once and then left alone
        for name in m.names().filter(|n| *n != lost) {
            assert_eq!(dest.copies.lock()[name], 1);
        }
    }

    #[test]
    fn silent_copy_failures_are_caught_by_reverification() {
        let m = manifest(6);
        let flaky = m.entries()[0].name.clone();
        let dest = FakeDest::default();
        dest.flaky.lock().insert(flaky.clone(), 2);
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        let report = scheduler(2, 5, &logger, &progress)
            .run(&m, &dest, &dest)
            .unwrap();
        assert_eq!(report.rounds, 3);
        assert_eq!(report.copy_failures, 0);
        assert_eq!(dest.copies.lock()[&flaky], 3);
    }

    #[test]
    fn concurrency_never_exceeds_jobs() {
        let dest = FakeDest::default();
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        scheduler(3, 2, &logger, &progress)
            .run(&manifest(40), &dest, &dest)
            .unwrap();
        let peak = dest.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {peak}");
        assert!(peak >= 1);
    }

    #[test]
    fn complete_destination_dispatches_nothing() {
        let m = manifest(3);
        let dest = FakeDest::default();
        for name in m.names() {
            dest.present.lock().insert(name.to_string());
        }
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        let report = scheduler(2, 2, &logger, &progress)
            .run(&m, &dest, &dest)
            .unwrap();
        assert_eq!(report.rounds, 0);
        assert_eq!(report.copies_dispatched, 0);
        assert!(dest.copies.lock().is_empty());
    }

    #[test]
    fn raised_cancel_flag_interrupts() {
        let dest = FakeDest::default();
        let cancel = AtomicBool::new(true);
        let (logger, progress) = (NoopLogger, TransferProgress::hidden());
        let err = scheduler(2, 3, &logger, &progress)
            .with_cancel(&cancel)
            .run(&manifest(4), &dest, &dest)
            .unwrap_err();
        assert!(matches!(err, TransferError::Interrupted));
        assert!(dest.copies.lock().is_empty());
    }
}
