//! Durable destinations for audit batches.
//!
//! A sink either persists a whole batch or reports failure; callers rely on
//! that to keep unflushed events buffered for the next attempt.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::event::AuditEvent;
use super::integrity::{IntegritySigner, VerificationReport};
use crate::error::StorageError;

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist all events or none of them.
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), StorageError>;

    /// Remove persisted events recorded strictly before `cutoff`. Returns the
    /// number of events (or day files, for file sinks) removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// In-process sink, used as the escalation target and in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), StorageError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok(before - events.len())
    }
}

/// Appends NDJSON to one file per UTC day: `audit-YYYY-MM-DD.jsonl`.
#[derive(Debug)]
pub struct JsonlFileSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

const FILE_PREFIX: &str = "audit-";
const FILE_SUFFIX: &str = ".jsonl";

impl JsonlFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for_day(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, day.format("%Y-%m-%d"), FILE_SUFFIX))
    }

    /// Read back every event written on `day`. Missing files read as empty.
    pub fn read_day(&self, day: NaiveDate) -> Result<Vec<AuditEvent>, StorageError> {
        let path = self.path_for_day(day);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| StorageError::ReadFailed {
                message: format!("{}:{}: {}", path.display(), idx + 1, e),
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Read back `day` and check every event's integrity hash.
    pub fn verify_day(
        &self,
        day: NaiveDate,
        signer: &IntegritySigner,
    ) -> Result<VerificationReport, StorageError> {
        let events = self.read_day(day)?;
        Ok(signer.verify_events(&events))
    }

    fn day_of(path: &Path) -> Option<NaiveDate> {
        let name = path.file_name()?.to_str()?;
        let date = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }

    /// Append to one day file, returning its length before the append.
    fn append_day(path: &Path, lines: &str) -> Result<u64, StorageError> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let original_len = file.metadata()?.len();
        let result = file
            .write_all(lines.as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(e) = result {
            let _ = file.set_len(original_len);
            return Err(StorageError::WriteFailed {
                message: format!("{}: {}", path.display(), e),
            });
        }
        Ok(original_len)
    }

    fn truncate_to(path: &Path, len: u64) {
        if let Ok(file) = OpenOptions::new().write(true).open(path) {
            let _ = file.set_len(len);
        }
    }
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }

        // Group by UTC day, preserving order within each day.
        let mut by_day: Vec<(NaiveDate, String)> = Vec::new();
        for event in events {
            let day = event.timestamp.date_naive();
            let line = event
                .to_json_line()
                .map_err(|e| StorageError::WriteFailed {
                    message: e.to_string(),
                })?;
            match by_day.iter_mut().find(|(d, _)| *d == day) {
                Some((_, buf)) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                None => by_day.push((day, format!("{}\n", line))),
            }
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::fs::create_dir_all(&self.dir)?;
        let mut written: Vec<(PathBuf, u64)> = Vec::with_capacity(by_day.len());
        for (day, lines) in &by_day {
            let path = self.path_for_day(*day);
            match Self::append_day(&path, lines) {
                Ok(len) => written.push((path, len)),
                Err(e) => {
                    // A batch spanning midnight must not stay half-written.
                    for (path, len) in &written {
                        Self::truncate_to(path, *len);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff_day = cutoff.date_naive();
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StorageError::PurgeFailed {
            message: format!("{}: {}", self.dir.display(), e),
        })?;
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if let Some(day) = Self::day_of(&path)
                && day < cutoff_day
            {
                std::fs::remove_file(&path).map_err(|e| StorageError::PurgeFailed {
                    message: format!("{}: {}", path.display(), e),
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::{EventCategory, EventContext, Severity};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn event_at(ts: DateTime<Utc>, retention_days: i64) -> AuditEvent {
        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: ts,
            event_type: "data_access".into(),
            severity: Severity::Info,
            category: EventCategory::DataAccess,
            description: "read".into(),
            context: EventContext::new(),
            details: BTreeMap::new(),
            integrity_hash: Some("00".into()),
            retention_date: ts + Duration::days(retention_days),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_write_and_purge() {
        let sink = MemorySink::new();
        let now = Utc::now();
        let old = event_at(now - Duration::days(30), 1);
        let fresh = event_at(now, 30);
        let cutoff = now - Duration::days(1);
        sink.write_batch(&[old, fresh.clone()]).await.unwrap();
        assert_eq!(sink.len(), 2);

        let removed = sink.purge_before(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sink.events(), vec![fresh]);
    }

    #[tokio::test]
    async fn test_file_sink_splits_by_day() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlFileSink::new(dir.path()).unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 0, 1, 0).unwrap();
        let a = event_at(day1, 10);
        let b = event_at(day2, 10);
        let c = event_at(day1, 10);
        sink.write_batch(&[a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();

        assert_eq!(sink.read_day(day1.date_naive()).unwrap(), vec![a, c]);
        assert_eq!(sink.read_day(day2.date_naive()).unwrap(), vec![b]);
        assert!(
            sink.path_for_day(day1.date_naive())
                .ends_with("audit-2024-03-01.jsonl")
        );
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlFileSink::new(dir.path()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 5, 12, 0, 0).unwrap();
        sink.write_batch(&[event_at(ts, 1)]).await.unwrap();
        sink.write_batch(&[event_at(ts, 1)]).await.unwrap();
        assert_eq!(sink.read_day(ts.date_naive()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_sink_purges_old_days() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlFileSink::new(dir.path()).unwrap();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        sink.write_batch(&[event_at(old, 1), event_at(recent, 1)])
            .await
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let cutoff = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(sink.purge_before(cutoff).await.unwrap(), 1);
        assert!(sink.read_day(old.date_naive()).unwrap().is_empty());
        assert_eq!(sink.read_day(recent.date_naive()).unwrap().len(), 1);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_verify_day_flags_edited_line() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlFileSink::new(dir.path()).unwrap();
        let signer = IntegritySigner::new(&[7u8; 32]).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let mut events = vec![event_at(ts, 1), event_at(ts, 1)];
        for e in &mut events {
            e.integrity_hash = Some(signer.sign(e).unwrap());
        }
        sink.write_batch(&events).await.unwrap();
        assert!(sink.verify_day(ts.date_naive(), &signer).unwrap().is_clean());

        let path = sink.path_for_day(ts.date_naive());
        let edited = std::fs::read_to_string(&path)
            .unwrap()
            .replacen("\"read\"", "\"write\"", 1);
        std::fs::write(&path, edited).unwrap();
        let report = sink.verify_day(ts.date_naive(), &signer).unwrap();
        assert_eq!(report.tampered, vec![events[0].event_id]);
        assert_eq!(report.valid, 1);
    }

    #[test]
    fn test_read_missing_day_is_empty() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlFileSink::new(dir.path()).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(sink.read_day(day).unwrap().is_empty());
    }

    #[test]
    fn test_read_corrupt_line_fails() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlFileSink::new(dir.path()).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        std::fs::write(sink.path_for_day(day), "{not json}\n").unwrap();
        assert!(matches!(
            sink.read_day(day),
            Err(StorageError::ReadFailed { .. })
        ));
    }
}
