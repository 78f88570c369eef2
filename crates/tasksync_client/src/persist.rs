//! Durable snapshot of the reconciled cache.
//!
//! Tasks (with their subtasks) are mirrored to a JSON file so a restarted
//! client resumes from the last known state. Lists are not persisted: a
//! reload shows lists only once they have been fetched again.
//!
//! Writes go through a [`CacheWriter`]: callers hand it the latest tasks and
//! return at once, a blocking-pool task writes them, and snapshots submitted
//! while a write is running collapse into one.

use crate::error::ClientResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tasksync_protocol::{is_temp_id, Task};
use tracing::warn;

/// On-disk shape of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCache {
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
    /// Tasks in display order, subtasks nested.
    pub tasks: Vec<Task>,
}

/// A snapshot file.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
}

impl CacheFile {
    /// Uses the file at `path`. Nothing is touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "cache".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Writes the snapshot atomically.
    ///
    /// Uses write-then-rename: the temp file is synced before it replaces the
    /// snapshot, and the directory is synced after the rename.
    pub fn save(&self, tasks: &[Task]) -> ClientResult<()> {
        let snapshot = PersistedCache {
            saved_at: Utc::now(),
            tasks: tasks.to_vec(),
        };
        let data = serde_json::to_vec(&snapshot)?;

        let dir = self.directory();
        fs::create_dir_all(dir)?;

        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        sync_directory(dir)?;
        Ok(())
    }

    /// Reads the snapshot, if one exists.
    ///
    /// Entries still holding provisional ids are dropped: their creates were
    /// never confirmed, so the ids mean nothing to the server.
    pub fn load(&self) -> ClientResult<Option<PersistedCache>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        if data.is_empty() {
            return Ok(None);
        }

        let mut snapshot: PersistedCache = serde_json::from_slice(&data)?;
        snapshot.tasks.retain(|task| !is_temp_id(task.id));
        for task in &mut snapshot.tasks {
            task.subtasks.retain(|subtask| !is_temp_id(subtask.id));
        }
        Ok(Some(snapshot))
    }

    /// Deletes the snapshot.
    pub fn remove(&self) -> ClientResult<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

/// Writes snapshots off the caller's thread, keeping only the newest one
/// pending.
#[derive(Debug)]
pub struct CacheWriter {
    file: CacheFile,
    latest: Mutex<Option<Vec<Task>>>,
    // Held across take-and-write so snapshots reach disk in submission order.
    io: Mutex<()>,
    writing: AtomicBool,
}

impl CacheWriter {
    /// Creates a writer for `file`.
    pub fn new(file: CacheFile) -> Arc<Self> {
        Arc::new(Self {
            file,
            latest: Mutex::new(None),
            io: Mutex::new(()),
            writing: AtomicBool::new(false),
        })
    }

    /// Returns the snapshot file.
    pub fn file(&self) -> &CacheFile {
        &self.file
    }

    /// Queues `tasks` for writing, replacing any snapshot not yet written.
    ///
    /// Inside a Tokio runtime the write runs on the blocking pool; outside
    /// one it runs inline.
    pub fn submit(self: &Arc<Self>, tasks: Vec<Task>) {
        *self.latest.lock() = Some(tasks);
        if self.writing.swap(true, Ordering::SeqCst) {
            // The running writer picks it up.
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = Arc::clone(self);
                handle.spawn_blocking(move || writer.drain());
            }
            Err(_) => self.drain(),
        }
    }

    /// Writes the pending snapshot, if any, before returning. Blocks.
    pub fn flush(&self) {
        self.write_next();
    }

    /// Returns true if a snapshot is waiting to be written.
    pub fn is_dirty(&self) -> bool {
        self.latest.lock().is_some()
    }

    fn drain(&self) {
        loop {
            while self.write_next() {}
            self.writing.store(false, Ordering::SeqCst);
            // A submit between the last take and the store above saw the flag
            // still set and left its snapshot to us.
            if !self.is_dirty() || self.writing.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    fn write_next(&self) -> bool {
        let _io = self.io.lock();
        let next = self.latest.lock().take();
        let Some(tasks) = next else {
            return false;
        };
        if let Err(e) = self.file.save(&tasks) {
            warn!(path = %self.file.path().display(), error = %e, "failed to persist cache");
        }
        true
    }
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> ClientResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> ClientResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_protocol::{NewSubtask, NewTask};
    use tempfile::tempdir;

    fn task(id: i64, text: &str) -> Task {
        let mut task = NewTask::new(text).provisional(id);
        task.user_id = 1;
        task
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempdir().unwrap();
        let file = CacheFile::new(dir.path().join("cache.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let file = CacheFile::new(dir.path().join("nested").join("cache.json"));

        let mut first = task(1, "Buy milk");
        first.subtasks.push(NewSubtask { text: "2%".into() }.provisional(5, 1));
        file.save(&[first.clone(), task(2, "Call mom")]).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded.tasks[0], first);
        assert!(!file.temp_path().exists());
    }

    #[test]
    fn provisional_entries_are_not_restored() {
        let dir = tempdir().unwrap();
        let file = CacheFile::new(dir.path().join("cache.json"));

        let mut confirmed = task(3, "Walk dog");
        confirmed
            .subtasks
            .push(NewSubtask { text: "leash".into() }.provisional(-2, 3));
        file.save(&[task(-1, "pending"), confirmed]).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].id, 3);
        assert!(loaded.tasks[0].subtasks.is_empty());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let file = CacheFile::new(dir.path().join("cache.json"));
        file.save(&[task(1, "old")]).unwrap();
        file.save(&[task(2, "new")]).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].text, "new");

        file.remove().unwrap();
        assert!(file.load().unwrap().is_none());
        file.remove().unwrap();
    }

    #[test]
    fn writer_without_runtime_writes_inline() {
        let dir = tempdir().unwrap();
        let writer = CacheWriter::new(CacheFile::new(dir.path().join("cache.json")));

        writer.submit(vec![task(1, "inline")]);
        assert!(!writer.is_dirty());
        let loaded = writer.file().load().unwrap().unwrap();
        assert_eq!(loaded.tasks[0].text, "inline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_submits_ends_with_the_newest() {
        let dir = tempdir().unwrap();
        let writer = CacheWriter::new(CacheFile::new(dir.path().join("cache.json")));

        for n in 1..=50 {
            writer.submit(vec![task(n, &format!("version {n}"))]);
        }
        writer.flush();

        assert!(!writer.is_dirty());
        let loaded = writer.file().load().unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].text, "version 50");
    }
}
