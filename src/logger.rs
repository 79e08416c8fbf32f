use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub trait Logger: Send + Sync {
    fn job_start(&self, _id: &str, _source: &str, _dest: &str, _block_size: u64, _jobs: usize) {}
    fn phase(&self, _name: &str, _detail: &str) {}
    fn round_start(&self, _round: u32, _pending: usize) {}
    fn copy_failed(&self, _block: &str, _msg: &str) {}
    fn warning(&self, _context: &str, _msg: &str) {}
    fn error(&self, _kind: &str, _msg: &str) {}
    fn done(&self, _blocks: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn job_start(&self, id: &str, source: &str, dest: &str, block_size: u64, jobs: usize) {
        self.line(&format!(
            "JOB id={id} src={source} dst={dest} block_size={block_size} jobs={jobs}"
        ));
    }
    fn phase(&self, name: &str, detail: &str) {
        self.line(&format!("PHASE name={name} {detail}"));
    }
    fn round_start(&self, round: u32, pending: usize) {
        self.line(&format!("ROUND n={round} pending={pending}"));
    }
    fn copy_failed(&self, block: &str, msg: &str) {
        self.line(&format!("COPY_FAILED block={block} msg={msg}"));
    }
    fn warning(&self, context: &str, msg: &str) {
        self.line(&format!("WARN ctx={context} msg={msg}"));
    }
    fn error(&self, kind: &str, msg: &str) {
        self.line(&format!("ERROR kind={kind} msg={msg}"));
    }
    fn done(&self, blocks: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE blocks={blocks} bytes={bytes} seconds={seconds:.3}"));
    }
}
