//! blockhop - resumable, verified, parallel block transfer
//!
//! Four positionals: source, destination, block size in MB, parallel jobs.
//! Either endpoint (not both) may be `user@host:path`.

use blockhop::cli::Args;
use blockhop::config;
use blockhop::error::TransferError;
use blockhop::job::{self, JobSummary};
use blockhop::logger::{Logger, NoopLogger, TextLogger};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() {
    // Ctrl-C stops dispatch; the job still cleans up before exiting
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        if let Err(e) = ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::SeqCst) {
                eprintln!("\nInterrupted again. Exiting without cleanup.");
                std::process::exit(130);
            }
            eprintln!("\nInterrupted by user. Cleaning up (Ctrl-C again to force)...");
        }) {
            eprintln!("warning: cannot install Ctrl-C handler: {e}");
        }
    }

    let args = Args::parse();

    // Choose logger once; zero overhead in hot paths with NoopLogger
    let logger: Arc<dyn Logger> = match args.log_file.as_ref().map(TextLogger::new) {
        Some(Ok(l)) => Arc::new(l),
        Some(Err(e)) => {
            eprintln!("warning: cannot open log file: {e:#}");
            Arc::new(NoopLogger)
        }
        None => Arc::new(NoopLogger),
    };

    match run(&args, logger.as_ref(), &cancel) {
        Ok(summary) => print_summary(&summary),
        Err(e) => {
            eprintln!("error[{}]: {}", e.kind(), e);
            if e.is_resumable() {
                if args.keep_on_failure {
                    eprintln!("staging kept; rerun the same command with --resume to continue");
                } else {
                    eprintln!("rerun with --keep-on-failure to keep blocks for --resume");
                }
            }
            std::process::exit(e.exit_code());
        }
    }
}

fn run(args: &Args, logger: &dyn Logger, cancel: &AtomicBool) -> Result<JobSummary, TransferError> {
    let file = config::load(args.config.as_deref())?;
    let (job, opts) = config::resolve(args, &file)?;
    if opts.verbose {
        println!("blockhop {}", env!("CARGO_PKG_VERSION"));
        println!("Source: {}", job.source);
        println!("Destination: {}", job.destination);
        println!(
            "Block size: {} MB, jobs: {}, rounds: {}, digest: {:?}",
            args.block_mb, job.jobs, job.rounds, opts.digest
        );
    }
    job::run(&job, &opts, logger, cancel)
}

fn print_summary(summary: &JobSummary) {
    println!();
    println!("=== Transfer Complete ===");
    println!(
        "Blocks: {} x {} MB{}",
        summary.blocks,
        summary.block_size / 1_048_576,
        if summary.resumed { " (resumed)" } else { "" }
    );
    println!(
        "Moved: {:.2} MB in {} round(s), {} copies",
        summary.bytes_moved as f64 / 1_048_576.0,
        summary.rounds,
        summary.copies
    );
    println!("Time: {:.2}s", summary.elapsed.as_secs_f64());
    println!("Throughput: {:.2} MB/s", summary.throughput_mb_s());
    println!();
    println!("Note: each block was digest-verified; the unpacked result was not.");
    println!("Compare the destination against the source if that matters.");
}
