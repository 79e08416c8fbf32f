use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalEntry {
    pub timestamp: String,
    pub job_id: String,
    pub source: String,
    pub destination: String,
    pub block_size: u64,
    pub status: JobStatus,
    pub blocks: Option<usize>,
    /// Staging was left in place for `--resume`
    #[serde(default)]
    pub staging_kept: bool,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn new(job_id: &str, source: &str, destination: &str, block_size: u64, status: JobStatus) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            job_id: job_id.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            block_size,
            status,
            blocks: None,
            staging_kept: false,
            error: None,
        }
    }

    fn same_transfer(&self, source: &str, destination: &str, block_size: u64) -> bool {
        self.source == source && self.destination == destination && self.block_size == block_size
    }
}

/// Append-only JSONL record of jobs run from one work directory.
pub struct JobJournal {
    path: PathBuf,
}

impl JobJournal {
    pub fn new(work_dir: &Path) -> Self {
        JobJournal {
            path: work_dir.join("journal.jsonl"),
        }
    }

    pub fn add_entry(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open job journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open job journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // a torn last line from a killed run is not fatal
            if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Latest entry for this transfer if it left staging behind: either it
    /// kept staging on failure, or it never got to record an outcome.
    pub fn resumable(&self, source: &str, destination: &str, block_size: u64) -> Result<Option<JournalEntry>> {
        let last = self
            .read()?
            .into_iter()
            .rev()
            .find(|e| e.same_transfer(source, destination, block_size));
        Ok(last.filter(|e| match e.status {
            JobStatus::InProgress => true,
            JobStatus::Completed => false,
            JobStatus::Interrupted | JobStatus::Failed => e.staging_kept,
        }))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Forget the journal once the work dir is being removed.
    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumable_only_when_staging_was_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path());
        assert!(journal.resumable("a", "b", 4).unwrap().is_none());

        // killed before recording an outcome
        journal.add_entry(&JournalEntry::new("j0", "a", "b", 4, JobStatus::InProgress)).unwrap();
        assert_eq!(journal.resumable("a", "b", 4).unwrap().unwrap().job_id, "j0");
        journal.add_entry(&JournalEntry::new("j0", "a", "b", 4, JobStatus::Failed)).unwrap();
        assert!(journal.resumable("a", "b", 4).unwrap().is_none());

        let mut failed = JournalEntry::new("j1", "a", "b", 4, JobStatus::Failed);
        failed.staging_kept = true;
        journal.add_entry(&JournalEntry::new("j1", "a", "b", 4, JobStatus::InProgress)).unwrap();
        journal.add_entry(&failed).unwrap();
        assert_eq!(journal.resumable("a", "b", 4).unwrap().unwrap().job_id, "j1");
        // different block size is a different transfer
        assert!(journal.resumable("a", "b", 8).unwrap().is_none());

        journal.add_entry(&JournalEntry::new("j2", "a", "b", 4, JobStatus::Completed)).unwrap();
        assert!(journal.resumable("a", "b", 4).unwrap().is_none());
    }

    #[test]
    fn torn_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path());
        journal.add_entry(&JournalEntry::new("j", "s", "d", 1, JobStatus::Interrupted)).unwrap();
        let mut f = OpenOptions::new().append(true).open(dir.path().join("journal.jsonl")).unwrap();
        f.write_all(b"{\"timestamp\":").unwrap();
        assert_eq!(journal.read().unwrap().len(), 1);
    }
}
