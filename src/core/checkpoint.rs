//! Durable batch progress: atomic checkpoint files and the contiguous
//! completion watermark.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::CheckpointError;
use crate::util::now_secs_f64;

const SUFFIX: &str = ".progress.json";

/// Persisted progress for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// Batch identifier.
    pub batch_id: String,
    /// Largest `k` such that positions `1..=k` all have outcomes.
    pub last_completed_offset: u64,
    /// Jobs in the batch.
    pub total_jobs: u64,
    /// Successful outcomes at or below the offset.
    pub success_count: u64,
    /// Failed outcomes at or below the offset.
    pub failure_count: u64,
    /// Output store path.
    pub output_location: String,
    /// Seconds since the epoch.
    pub created_at: f64,
    /// Seconds since the epoch.
    pub last_updated_at: f64,
}

impl ProgressRecord {
    /// Fresh record with nothing completed.
    #[must_use]
    pub fn new(batch_id: impl Into<String>, total_jobs: u64, output_location: impl Into<String>) -> Self {
        let now = now_secs_f64();
        Self {
            batch_id: batch_id.into(),
            last_completed_offset: 0,
            total_jobs,
            success_count: 0,
            failure_count: 0,
            output_location: output_location.into(),
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Whether every job is at or below the offset.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.last_completed_offset >= self.total_jobs
    }
}

/// Reads and writes `<dir>/<batchId>.progress.json`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Open (and create if needed) the checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Directory holding checkpoint files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File used for `batch_id`.
    #[must_use]
    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        let safe: String = batch_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}{SUFFIX}"))
    }

    /// Strict read: a corrupt file is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] or [`CheckpointError::Decode`].
    pub fn read(&self, batch_id: &str) -> Result<Option<ProgressRecord>, CheckpointError> {
        read_file(&self.path_for(batch_id))
    }

    /// Load the checkpoint for `batch_id`. A corrupt file is logged and
    /// treated as absent, so the batch starts over.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the file exists but cannot be read.
    pub fn load(&self, batch_id: &str) -> Result<Option<ProgressRecord>, CheckpointError> {
        match self.read(batch_id) {
            Ok(record) => Ok(record),
            Err(CheckpointError::Decode { path, source }) => {
                warn!(path = %path, error = %source, "checkpoint unreadable, starting from scratch");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `record` atomically: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] on any filesystem failure; the previous
    /// checkpoint is left intact.
    pub fn save(&self, record: &ProgressRecord) -> Result<(), CheckpointError> {
        let target = self.path_for(&record.batch_id);
        let tmp = self.dir.join(format!(".checkpoint-{}.tmp", uuid::Uuid::new_v4()));

        let body = serde_json::to_vec_pretty(record).map_err(|source| CheckpointError::Decode {
            path: target.display().to_string(),
            source,
        })?;
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::Io {
                path: target.display().to_string(),
                source: e,
            });
        }
        debug!(
            batch_id = %record.batch_id,
            offset = record.last_completed_offset,
            total = record.total_jobs,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint for `batch_id`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if removal fails.
    pub fn clear(&self, batch_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(batch_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(batch_id, "checkpoint cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Every unfinished batch with a readable checkpoint, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory cannot be listed.
    pub fn list_pending(&self) -> Result<Vec<ProgressRecord>, CheckpointError> {
        let mut pending = Vec::new();
        for path in self.checkpoint_files()? {
            match read_file(&path) {
                Ok(Some(record)) if !record.is_complete() => pending.push(record),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping unreadable checkpoint"),
            }
        }
        pending.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(pending)
    }

    /// Remove every checkpoint file. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] on the first failed removal.
    pub fn clear_all(&self) -> Result<usize, CheckpointError> {
        let files = self.checkpoint_files()?;
        for path in &files {
            fs::remove_file(path).map_err(|source| CheckpointError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }
        info!(removed = files.len(), "all checkpoints cleared");
        Ok(files.len())
    }

    fn checkpoint_files(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;
        Ok(entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(SUFFIX))
            })
            .collect())
    }
}

fn read_file(path: &Path) -> Result<Option<ProgressRecord>, CheckpointError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_reader(std::io::BufReader::new(file))
        .map(Some)
        .map_err(|source| CheckpointError::Decode {
            path: path.display().to_string(),
            source,
        })
}

/// Time- or count-based save trigger, whichever fires first.
#[derive(Debug)]
pub struct SaveCadence {
    interval: Duration,
    every: u64,
    last: Instant,
    since: u64,
}

impl SaveCadence {
    /// Save every `interval` or every `every` outcomes.
    #[must_use]
    pub fn new(interval: Duration, every: u64) -> Self {
        Self {
            interval,
            every: every.max(1),
            last: Instant::now(),
            since: 0,
        }
    }

    /// Count one outcome; returns whether a save is due.
    pub fn tick(&mut self) -> bool {
        self.since += 1;
        self.is_due()
    }

    /// Whether a save is due without counting anything.
    #[must_use]
    pub fn is_due(&self) -> bool {
        self.since > 0 && (self.since >= self.every || self.last.elapsed() >= self.interval)
    }

    /// Reset after a save.
    pub fn saved(&mut self) {
        self.since = 0;
        self.last = Instant::now();
    }
}

/// Advances the contiguous watermark as outcomes arrive in any order.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    record: ProgressRecord,
    /// Completed positions above the watermark, with their success flag.
    ahead: BTreeMap<u64, bool>,
}

impl ProgressTracker {
    /// Track from `record`, fresh or loaded.
    #[must_use]
    pub const fn new(record: ProgressRecord) -> Self {
        Self {
            record,
            ahead: BTreeMap::new(),
        }
    }

    /// Record the outcome at 1-based `position`. Positions at or below the
    /// watermark are ignored.
    pub fn observe(&mut self, position: u64, success: bool) {
        if position <= self.record.last_completed_offset {
            return;
        }
        self.ahead.insert(position, success);
        while let Some(success) = self.ahead.remove(&(self.record.last_completed_offset + 1)) {
            self.record.last_completed_offset += 1;
            if success {
                self.record.success_count += 1;
            } else {
                self.record.failure_count += 1;
            }
        }
    }

    /// Current watermark.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.record.last_completed_offset
    }

    /// Outcomes held above the watermark.
    #[must_use]
    pub fn held(&self) -> usize {
        self.ahead.len()
    }

    /// Whether every job is at or below the watermark.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.record.is_complete()
    }

    /// Snapshot for persistence, stamped with the current time.
    #[must_use]
    pub fn snapshot(&self) -> ProgressRecord {
        let mut record = self.record.clone();
        record.last_updated_at = now_secs_f64();
        record
    }

    /// Committed record without re-stamping.
    #[must_use]
    pub const fn record(&self) -> &ProgressRecord {
        &self.record
    }
}
