//! Append-only JSON-lines ledger.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use curio_core::LedgerEntry;

/// Entries are only ever appended; nothing in this type rewrites a line.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
    appended: u64,
}

impl Ledger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening ledger {}", path.display()))?;
        Ok(Self {
            path,
            file,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("serializing ledger entry")?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .with_context(|| format!("appending to ledger {}", self.path.display()))?;
        self.appended += 1;
        Ok(())
    }

    /// Flush to disk; called at stage boundaries before done-markers are written.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .with_context(|| format!("flushing ledger {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("syncing ledger {}", self.path.display()))
    }

    /// Replay every entry in file order. A missing ledger replays as empty.
    pub fn replay(path: &Path) -> Result<Vec<LedgerEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).with_context(|| format!("opening ledger {}", path.display()))?;
        let mut out = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading ledger {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .with_context(|| format!("parsing {} line {}", path.display(), line_no + 1))?;
            out.push(entry);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use curio_core::{Disposition, ReasonCode, Stage};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn entry(target: &str, disposition: Disposition, reason: ReasonCode) -> LedgerEntry {
        LedgerEntry {
            run_id: Uuid::nil(),
            target_id: target.to_string(),
            content_hash: Some("abc".into()),
            disposition,
            reason,
            detail: None,
            stage: Stage::Screen,
            source_path: Some("data.jsonl".into()),
            shard: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn reopening_appends_instead_of_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger/screen.jsonl");

        let mut first = Ledger::open(&path).unwrap();
        first
            .append(&entry("t1", Disposition::Accepted, ReasonCode::Ok))
            .unwrap();
        first.sync().unwrap();
        drop(first);

        let mut second = Ledger::open(&path).unwrap();
        second
            .append(&entry("t2", Disposition::Pitched, ReasonCode::DenylistMatch))
            .unwrap();
        second.sync().unwrap();

        let replayed = Ledger::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].target_id, "t1");
        assert_eq!(replayed[1].reason, ReasonCode::DenylistMatch);
    }

    #[test]
    fn missing_ledger_replays_empty() {
        let dir = tempdir().unwrap();
        assert!(Ledger::replay(&dir.path().join("none.jsonl")).unwrap().is_empty());
    }
}
