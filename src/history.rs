//! # History Store
//!
//! The persistent index of finished transcriptions, kept in one JSON file
//! (`history.json`) at the artifacts root.
//!
//! ## Concurrency:
//! Every operation, reads included, holds an exclusive advisory lock on the sidecar
//! `history.json.lock` for a full read-modify-write of the index. Waiting for the
//! lock is bounded; running out of time is a [`HistoryError::LockTimeout`].
//!
//! ## File Format:
//! ```json
//! {
//!   "version": "1.0",
//!   "updated_at": "2025-01-01T12:00:00Z",
//!   "records": [ { "task_id": "...", "title": "...", ... } ]
//! }
//! ```
//! Records are kept most recently added first. An unreadable file is logged and
//! treated as an empty index.
//!
//! All methods block; async callers go through `web::block` or `spawn_blocking`.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const INDEX_VERSION: &str = "1.0";
pub const MAX_TITLE_CHARS: usize = 200;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Timed out after {timeout_secs}s waiting for history lock {}", .path.display())]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid history record: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Upload,
    Url,
    Youtube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

/// Record status. Separate from task status; `Deleted` is the soft-delete marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Pending,
    Downloading,
    Downloaded,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl std::str::FromStr for HistoryStatus {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .map_err(|_| HistoryError::Invalid(format!("unknown status '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub source_url: Option<String>,
    pub source_type: SourceType,
    pub media_type: MediaType,
    /// Seconds
    #[serde(default)]
    pub duration: u64,
    /// Bytes
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub viewed: bool,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub status: HistoryStatus,
}

impl HistoryRecord {
    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.task_id.trim().is_empty() {
            return Err(HistoryError::Invalid("task_id must not be empty".to_string()));
        }
        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(HistoryError::Invalid(format!(
                "title exceeds {} characters",
                MAX_TITLE_CHARS
            )));
        }
        Ok(())
    }
}

/// Fields a caller may change. `None` leaves the stored value untouched.
///
/// Status is not part of this; it moves through [`HistoryStore::set_status`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryUpdate {
    pub viewed: Option<bool>,
    pub tags: Option<Vec<String>>,
}

impl HistoryUpdate {
    fn apply(&self, record: &mut HistoryRecord) {
        if let Some(viewed) = self.viewed {
            record.viewed = viewed;
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryIndex {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<HistoryRecord>,
}

impl HistoryIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            updated_at: Utc::now(),
            records: Vec::new(),
        }
    }
}

/// Parameters for [`HistoryStore::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    /// 1-based
    pub page: usize,
    pub limit: usize,
    pub status: Option<HistoryStatus>,
    pub include_deleted: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            status: None,
            include_deleted: false,
        }
    }
}

/// Exclusive lock on the sidecar file, released on drop.
struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release history lock: {}", e);
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    max_page_size: usize,
}

impl HistoryStore {
    /// ## Parameters:
    /// - **path**: Location of `history.json`; the lock file sits next to it
    /// - **lock_timeout**: Longest wait for the lock
    /// - **max_page_size**: Upper bound `list` clamps `limit` to
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration, max_page_size: usize) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock_timeout,
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<IndexLock, HistoryError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        let deadline = Instant::now() + self.lock_timeout;
        let mut waited = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(IndexLock { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        warn!(path = %self.lock_path.display(), "History lock wait timed out");
                        return Err(HistoryError::LockTimeout {
                            path: self.lock_path.clone(),
                            timeout_secs: self.lock_timeout.as_secs(),
                        });
                    }
                    if !waited {
                        debug!(path = %self.lock_path.display(), "Waiting for history lock");
                        waited = true;
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the index; caller must hold the lock.
    fn read_index(&self) -> HistoryIndex {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HistoryIndex::empty(),
            Err(e) => {
                error!(path = %self.path.display(), "Failed to read history file, starting empty: {}", e);
                return HistoryIndex::empty();
            }
        };

        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            error!(path = %self.path.display(), "History file is corrupt, starting empty: {}", e);
            HistoryIndex::empty()
        })
    }

    /// Replace the index file atomically; caller must hold the lock.
    fn write_index(&self, index: &mut HistoryIndex) -> Result<(), HistoryError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        index.updated_at = Utc::now();
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, index)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| HistoryError::Io(e.error))?;
        Ok(())
    }

    /// Insert at the front. An existing `task_id` wins and the call is a no-op.
    ///
    /// ## Returns:
    /// `true` when the record was inserted.
    pub fn add(&self, record: HistoryRecord) -> Result<bool, HistoryError> {
        record.validate()?;
        let _lock = self.lock()?;
        let mut index = self.read_index();

        if index.records.iter().any(|r| r.task_id == record.task_id) {
            warn!(task_id = %record.task_id, "History record already exists, skipping");
            return Ok(false);
        }

        let task_id = record.task_id.clone();
        index.records.insert(0, record);
        self.write_index(&mut index)?;
        info!(task_id = %task_id, "Added history record");
        Ok(true)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        let _lock = self.lock()?;
        Ok(self
            .read_index()
            .records
            .into_iter()
            .find(|r| r.task_id == task_id))
    }

    /// Apply the fields present in `update`, re-validate and rewrite the index.
    ///
    /// ## Returns:
    /// `false` when no record has this id.
    pub fn update(&self, task_id: &str, update: &HistoryUpdate) -> Result<bool, HistoryError> {
        self.modify(task_id, |record| {
            update.apply(record);
            Ok(())
        })
    }

    /// Move a record to `status`. `deleted` is final: leaving it is rejected.
    pub fn set_status(&self, task_id: &str, status: HistoryStatus) -> Result<bool, HistoryError> {
        self.modify(task_id, |record| {
            if record.status == HistoryStatus::Deleted && status != HistoryStatus::Deleted {
                return Err(HistoryError::Invalid(format!(
                    "record {} is deleted and cannot become {:?}",
                    record.task_id, status
                )));
            }
            record.status = status;
            Ok(())
        })
    }

    pub fn soft_delete(&self, task_id: &str) -> Result<bool, HistoryError> {
        self.set_status(task_id, HistoryStatus::Deleted)
    }

    /// Full read-modify-write of one record under the lock. Nothing is written when
    /// `change` or validation fails.
    fn modify<F>(&self, task_id: &str, change: F) -> Result<bool, HistoryError>
    where
        F: FnOnce(&mut HistoryRecord) -> Result<(), HistoryError>,
    {
        let _lock = self.lock()?;
        let mut index = self.read_index();

        let Some(record) = index.records.iter_mut().find(|r| r.task_id == task_id) else {
            warn!(task_id = %task_id, "History record not found for update");
            return Ok(false);
        };

        let mut updated = record.clone();
        change(&mut updated)?;
        updated.validate()?;
        *record = updated;

        self.write_index(&mut index)?;
        info!(task_id = %task_id, "Updated history record");
        Ok(true)
    }

    /// One page of records in index order, plus the filtered total.
    pub fn list(&self, query: &ListQuery) -> Result<(Vec<HistoryRecord>, usize), HistoryError> {
        let page = query.page.max(1);
        let limit = query.limit.clamp(1, self.max_page_size);

        let _lock = self.lock()?;
        let filtered: Vec<HistoryRecord> = self
            .read_index()
            .records
            .into_iter()
            .filter(|r| query.include_deleted || r.status != HistoryStatus::Deleted)
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .collect();

        let total = filtered.len();
        let records = filtered
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
        Ok((records, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> HistoryStore {
        HistoryStore::new(dir.path().join("history.json"), Duration::from_secs(2), 100)
    }

    fn record(task_id: &str, title: &str) -> HistoryRecord {
        HistoryRecord {
            task_id: task_id.to_string(),
            title: title.to_string(),
            source_url: None,
            source_type: SourceType::Upload,
            media_type: MediaType::Audio,
            duration: 61,
            file_size: 1024,
            tags: vec!["rust".to_string()],
            created_at: Utc::now(),
            viewed: false,
            thumbnail_url: None,
            status: HistoryStatus::Completed,
        }
    }

    #[test]
    fn test_duplicate_add_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.add(record("t1", "First title")).unwrap());
        assert!(!store.add(record("t1", "Second title")).unwrap());

        let (records, total) = store.list(&ListQuery::default()).unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].title, "First title");
    }

    #[test]
    fn test_soft_delete_hides_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("t1", "Episode")).unwrap();

        assert!(store.soft_delete("t1").unwrap());
        let (records, total) = store.list(&ListQuery::default()).unwrap();
        assert!(records.is_empty());
        assert_eq!(total, 0);

        let (records, _) = store
            .list(&ListQuery {
                include_deleted: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, HistoryStatus::Deleted);
    }

    #[test]
    fn test_pagination_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for i in 1..=10 {
            store.add(record(&format!("t{}", i), &format!("Episode {}", i))).unwrap();
        }

        let (records, total) = store
            .list(&ListQuery {
                page: 2,
                limit: 3,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(total, 10);
        // Most recent first: t10 t9 t8 | t7 t6 t5
        let ids: Vec<_> = records.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t7", "t6", "t5"]);
    }

    #[test]
    fn test_limit_and_page_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"), Duration::from_secs(2), 5);
        for i in 0..8 {
            store.add(record(&format!("t{}", i), "Episode")).unwrap();
        }

        let (records, _) = store
            .list(&ListQuery {
                page: 0,
                limit: 1000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].task_id, "t7");

        let (records, _) = store
            .list(&ListQuery {
                limit: 0,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_status_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("done", "Done")).unwrap();
        let mut failed = record("bad", "Bad");
        failed.status = HistoryStatus::Failed;
        store.add(failed).unwrap();

        let (records, total) = store
            .list(&ListQuery {
                status: Some(HistoryStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].task_id, "bad");
    }

    #[test]
    fn test_empty_update_only_touches_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("t1", "Episode")).unwrap();

        let read = || -> HistoryIndex {
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap()
        };
        let before = read();
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.update("t1", &HistoryUpdate::default()).unwrap());
        let after = read();

        assert_eq!(
            serde_json::to_string(&before.records).unwrap(),
            serde_json::to_string(&after.records).unwrap()
        );
        assert!(after.updated_at > before.updated_at);
    }

    #[test]
    fn test_partial_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("t1", "Episode")).unwrap();

        let update = HistoryUpdate {
            viewed: Some(true),
            tags: Some(vec!["ai".to_string(), "podcast".to_string()]),
            ..Default::default()
        };
        assert!(store.update("t1", &update).unwrap());
        assert!(!store.update("missing", &update).unwrap());

        let stored = store.get("t1").unwrap().unwrap();
        assert!(stored.viewed);
        assert_eq!(stored.tags, vec!["ai", "podcast"]);
        assert_eq!(stored.title, "Episode");
    }

    #[test]
    fn test_deleted_record_stays_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add(record("t1", "Episode")).unwrap();
        assert!(store.soft_delete("t1").unwrap());

        let err = store.set_status("t1", HistoryStatus::Completed).unwrap_err();
        assert!(matches!(err, HistoryError::Invalid(_)));
        assert!(store
            .update("t1", &HistoryUpdate { viewed: Some(true), ..Default::default() })
            .unwrap());

        let stored = store.get("t1").unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Deleted);
        assert!(stored.viewed);
        let (records, total) = store.list(&ListQuery::default()).unwrap();
        assert!(records.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_status_moves_until_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut pending = record("t1", "Episode");
        pending.status = HistoryStatus::Processing;
        store.add(pending).unwrap();

        assert!(store.set_status("t1", HistoryStatus::Failed).unwrap());
        assert!(!store.set_status("missing", HistoryStatus::Failed).unwrap());
        assert_eq!(store.get("t1").unwrap().unwrap().status, HistoryStatus::Failed);

        assert!(store.soft_delete("t1").unwrap());
        assert!(store.soft_delete("t1").unwrap());
    }

    #[test]
    fn test_invalid_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(&dir).add(record("  ", "Episode")).unwrap_err();
        assert!(matches!(err, HistoryError::Invalid(_)));
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        std::fs::write(store.path(), b"{not json").unwrap();

        let (records, total) = store.list(&ListQuery::default()).unwrap();
        assert!(records.is_empty());
        assert_eq!(total, 0);

        assert!(store.add(record("t1", "Recovered")).unwrap());
        assert_eq!(store.get("t1").unwrap().unwrap().title, "Recovered");
    }

    #[test]
    fn test_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(
            dir.path().join("history.json"),
            Duration::from_millis(100),
            100,
        );

        let holder = File::create(dir.path().join("history.json.lock")).unwrap();
        holder.lock_exclusive().unwrap();

        let err = store.get("t1").unwrap_err();
        assert!(matches!(err, HistoryError::LockTimeout { .. }));

        FileExt::unlock(&holder).unwrap();
        assert!(store.get("t1").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_adds_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = HistoryStore::new(path, Duration::from_secs(5), 100);
                    store.add(record(&format!("t{}", i), "Episode")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = HistoryStore::new(path, Duration::from_secs(5), 100);
        let (_, total) = store.list(&ListQuery::default()).unwrap();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Deleted".parse::<HistoryStatus>().unwrap(), HistoryStatus::Deleted);
        assert!("archived".parse::<HistoryStatus>().is_err());
    }
}
