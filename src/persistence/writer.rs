//! Crash-safe replacement of the document file.
//!
//! A save never edits the primary file in place:
//! 1. serialize the snapshot (nothing on disk is touched if this fails)
//! 2. copy the current primary to `<file>.bak`
//! 3. write and fsync `<file>.tmp`
//! 4. rename `<file>.tmp` over the primary
//!
//! If step 3 or 4 fails the primary is restored from the backup. The backup
//! is removed after a grace period unless a newer save has refreshed it. One
//! cleanup task per writer tracks that deadline.

use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::store::Snapshot;

/// Stage of a save, reported with I/O failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    CreateDir,
    Read,
    Backup,
    WriteTemp,
    Sync,
    Rename,
    Restore,
}

impl fmt::Display for WriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteStep::CreateDir => "create directory",
            WriteStep::Read => "read",
            WriteStep::Backup => "back up",
            WriteStep::WriteTemp => "write temp file",
            WriteStep::Sync => "sync",
            WriteStep::Rename => "rename into",
            WriteStep::Restore => "restore",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to {step} {}: {source}", .path.display())]
    Io {
        step: WriteStep,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Document {} is not valid JSON and no usable backup exists: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(step: WriteStep, path: &Path, source: io::Error) -> Self {
        PersistError::Io {
            step,
            path: path.to_path_buf(),
            source,
        }
    }

    fn step(&self) -> Option<WriteStep> {
        match self {
            PersistError::Io { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailPoint {
    Backup,
    BeforeRename,
}

/// Deadline of the current `.bak` file, shared with its cleanup task
#[derive(Debug)]
struct BackupReaper {
    path: PathBuf,
    grace: Duration,
    deadline: parking_lot::Mutex<Option<Instant>>,
    /// Held by a save from backup to rename and by the cleanup while it
    /// deletes, so a fresh backup is never removed
    lock: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl BackupReaper {
    fn arm(&self) {
        *self.deadline.lock() = Some(Instant::now() + self.grace);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            let deadline = *self.deadline.lock();
            let Some(at) = deadline else {
                self.wake.notified().await;
                continue;
            };

            tokio::select! {
                _ = tokio::time::sleep_until(at) => {}
                _ = self.wake.notified() => continue,
            }

            let _guard = self.lock.lock().await;
            if *self.deadline.lock() != Some(at) {
                continue;
            }
            *self.deadline.lock() = None;
            match fs::remove_file(&self.path).await {
                Ok(()) => debug!(path = %self.path.display(), "Removed expired backup"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove backup"),
            }
        }
    }
}

/// Owns the primary, temp and backup paths of one document
#[derive(Debug)]
pub struct AtomicWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    backup_path: PathBuf,
    reaper: Arc<BackupReaper>,
    reaper_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    writes: AtomicU64,
    #[cfg(test)]
    fail_point: parking_lot::Mutex<Option<FailPoint>>,
    #[cfg(test)]
    gauge: WriteGauge,
}

/// Counts overlapping calls to [`AtomicWriter::write`]
#[cfg(test)]
#[derive(Debug, Default)]
struct WriteGauge {
    in_flight: std::sync::atomic::AtomicUsize,
    high_water: std::sync::atomic::AtomicUsize,
    delay: parking_lot::Mutex<Option<Duration>>,
    reaper_spawns: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
struct InFlight<'a>(&'a WriteGauge);

#[cfg(test)]
impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl AtomicWriter {
    pub fn new(path: impl Into<PathBuf>, backup_grace: Duration) -> Self {
        let path = path.into();
        let backup_path = with_suffix(&path, ".bak");
        Self {
            tmp_path: with_suffix(&path, ".tmp"),
            reaper: Arc::new(BackupReaper {
                path: backup_path.clone(),
                grace: backup_grace,
                deadline: parking_lot::Mutex::new(None),
                lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
            }),
            reaper_task: parking_lot::Mutex::new(None),
            backup_path,
            path,
            writes: AtomicU64::new(0),
            #[cfg(test)]
            fail_point: parking_lot::Mutex::new(None),
            #[cfg(test)]
            gauge: WriteGauge::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Number of saves that reached the rename
    pub fn writes_completed(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_fail_point(&self, point: Option<FailPoint>) {
        *self.fail_point.lock() = point;
    }

    /// Hold every write for `delay` so overlapping calls become visible
    #[cfg(test)]
    pub(crate) fn set_write_delay(&self, delay: Option<Duration>) {
        *self.gauge.delay.lock() = delay;
    }

    /// Most writes ever in progress at the same time
    #[cfg(test)]
    pub(crate) fn max_concurrent_writes(&self) -> usize {
        self.gauge.high_water.load(Ordering::Acquire)
    }

    #[cfg(test)]
    async fn enter_write(&self) -> InFlight<'_> {
        let now = self.gauge.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.gauge.high_water.fetch_max(now, Ordering::AcqRel);
        let delay = *self.gauge.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        InFlight(&self.gauge)
    }

    #[cfg(test)]
    fn check_fail_point(&self, point: FailPoint, step: WriteStep) -> Result<(), PersistError> {
        if *self.fail_point.lock() == Some(point) {
            return Err(PersistError::io(
                step,
                &self.path,
                io::Error::other("injected failure"),
            ));
        }
        Ok(())
    }

    /// Read the document at startup.
    ///
    /// A missing file is created with empty collections. An unreadable
    /// primary falls back to the backup, which is then promoted.
    pub async fn open(&self) -> Result<Snapshot, PersistError> {
        self.ensure_dir().await?;

        if fs::try_exists(&self.tmp_path).await.unwrap_or(false) {
            warn!(path = %self.tmp_path.display(), "Removing temp file left by an interrupted save");
            if let Err(e) = fs::remove_file(&self.tmp_path).await {
                warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove stale temp file");
            }
        }

        let primary_exists = fs::try_exists(&self.path)
            .await
            .map_err(|e| PersistError::io(WriteStep::Read, &self.path, e))?;

        if primary_exists {
            match self.read_snapshot(&self.path).await {
                Ok(snapshot) => {
                    info!(
                        path = %self.path.display(),
                        users = snapshot.users.len(),
                        "Loaded document store"
                    );
                    return Ok(snapshot);
                }
                Err(primary_err) => {
                    error!(path = %self.path.display(), error = %primary_err, "Primary document unreadable, trying backup");
                    return match self.read_snapshot(&self.backup_path).await {
                        Ok(snapshot) => {
                            // Move the bad file aside so the save below does not back it up
                            let corrupt_path = with_suffix(&self.path, ".corrupt");
                            fs::rename(&self.path, &corrupt_path)
                                .await
                                .map_err(|e| PersistError::io(WriteStep::Restore, &corrupt_path, e))?;
                            warn!(
                                path = %self.backup_path.display(),
                                corrupt = %corrupt_path.display(),
                                "Promoting backup to primary"
                            );
                            self.write(&snapshot).await?;
                            Ok(snapshot)
                        }
                        Err(_) => Err(primary_err),
                    };
                }
            }
        }

        if let Ok(snapshot) = self.read_snapshot(&self.backup_path).await {
            warn!(path = %self.backup_path.display(), "Primary document missing, promoting backup");
            self.write(&snapshot).await?;
            return Ok(snapshot);
        }

        info!(path = %self.path.display(), "No document found, creating an empty store");
        let snapshot = Snapshot::default();
        self.write(&snapshot).await?;
        Ok(snapshot)
    }

    async fn read_snapshot(&self, path: &Path) -> Result<Snapshot, PersistError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| PersistError::io(WriteStep::Read, path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| PersistError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn ensure_dir(&self) -> Result<(), PersistError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| PersistError::io(WriteStep::CreateDir, dir, e))?;
        }
        Ok(())
    }

    /// Replace the primary file with `value`
    pub async fn write<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), PersistError> {
        #[cfg(test)]
        let _in_flight = self.enter_write().await;

        let bytes = serde_json::to_vec_pretty(value).map_err(PersistError::Serialize)?;

        self.ensure_dir().await?;

        let _backup = self.reaper.lock.lock().await;
        match self.replace(&bytes).await {
            Ok(backed_up) => {
                self.writes.fetch_add(1, Ordering::AcqRel);
                debug!(path = %self.path.display(), bytes = bytes.len(), "Document saved");
                if backed_up {
                    self.schedule_backup_removal();
                }
                Ok(())
            }
            Err(err) => {
                match &err {
                    PersistError::Io { step, path, source } => error!(
                        step = %step,
                        path = %path.display(),
                        kind = ?source.kind(),
                        os_error = ?source.raw_os_error(),
                        error = %source,
                        "Failed to save document"
                    ),
                    other => error!(error = %other, "Failed to save document"),
                }

                // A failed backup copy may be partial; the primary is still intact then.
                if matches!(err.step(), Some(WriteStep::WriteTemp | WriteStep::Sync | WriteStep::Rename)) {
                    if let Err(restore_err) = self.restore_from_backup().await {
                        error!(error = %restore_err, "Failed to restore document from backup");
                    }
                }
                let _ = fs::remove_file(&self.tmp_path).await;
                Err(err)
            }
        }
    }

    /// Steps 2-4. Returns whether a backup was taken.
    async fn replace(&self, bytes: &[u8]) -> Result<bool, PersistError> {
        let mut backed_up = false;
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            #[cfg(test)]
            self.check_fail_point(FailPoint::Backup, WriteStep::Backup)?;

            fs::copy(&self.path, &self.backup_path)
                .await
                .map_err(|e| PersistError::io(WriteStep::Backup, &self.backup_path, e))?;
            backed_up = true;
        }

        let mut file = fs::File::create(&self.tmp_path)
            .await
            .map_err(|e| PersistError::io(WriteStep::WriteTemp, &self.tmp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| PersistError::io(WriteStep::WriteTemp, &self.tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| PersistError::io(WriteStep::Sync, &self.tmp_path, e))?;
        drop(file);

        #[cfg(test)]
        self.check_fail_point(FailPoint::BeforeRename, WriteStep::Rename)?;

        fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|e| PersistError::io(WriteStep::Rename, &self.path, e))?;

        self.sync_dir().await;
        Ok(backed_up)
    }

    #[cfg(unix)]
    async fn sync_dir(&self) {
        let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) else {
            return;
        };
        match fs::File::open(dir).await {
            Ok(handle) => {
                if let Err(e) = handle.sync_all().await {
                    warn!(path = %dir.display(), error = %e, "Failed to sync data directory");
                }
            }
            Err(e) => warn!(path = %dir.display(), error = %e, "Failed to open data directory for sync"),
        }
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) {}

    /// Put the backup back in place through the same temp+rename path
    async fn restore_from_backup(&self) -> Result<(), PersistError> {
        if !fs::try_exists(&self.backup_path).await.unwrap_or(false) {
            return Ok(());
        }
        fs::copy(&self.backup_path, &self.tmp_path)
            .await
            .map_err(|e| PersistError::io(WriteStep::Restore, &self.tmp_path, e))?;
        fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|e| PersistError::io(WriteStep::Restore, &self.path, e))?;
        warn!(path = %self.path.display(), "Restored document from backup");
        Ok(())
    }

    /// Push the backup deadline out, starting the cleanup task on first use
    fn schedule_backup_removal(&self) {
        self.reaper.arm();
        let mut task = self.reaper_task.lock();
        if task.is_none() {
            #[cfg(test)]
            self.gauge.reaper_spawns.fetch_add(1, Ordering::AcqRel);
            *task = Some(tokio::spawn(self.reaper.clone().run()));
        }
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        if let Some(task) = self.reaper_task.get_mut().take() {
            task.abort();
        }
    }
}
