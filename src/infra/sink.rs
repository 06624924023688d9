//! Deduplicating JSON-lines result sink.
//!
//! Records are handed to a dedicated writer thread over a bounded channel.
//! The writer drops duplicates by [`DedupKey`] (first occurrence wins),
//! buffers, and appends to the output file when the buffer reaches
//! `flush_size` or `flush_interval` elapses. A failed write keeps the buffer
//! for the next attempt.
//!
//! File layout: one header object on the first line, then one record per line.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{DedupKey, Record, SinkError};

/// One output line: the collaborator's record plus engine fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord<R> {
    /// Collaborator payload, flattened into the line.
    #[serde(flatten)]
    pub record: R,
    /// Input that produced the record.
    pub source_input: String,
    /// Ladder position of that input.
    pub retry_depth: usize,
}

impl<R: Record> OutputRecord<R> {
    /// Wrap a record.
    #[must_use]
    pub fn new(record: R, source_input: impl Into<String>, retry_depth: usize) -> Self {
        Self {
            record,
            source_input: source_input.into(),
            retry_depth,
        }
    }

    /// Key of the wrapped record.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        self.record.dedup_key()
    }
}

/// First line of every output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputHeader {
    /// Always `true`; marks the line as a header.
    pub header: bool,
    /// Batch that created the file.
    pub batch_id: String,
    /// Record columns followed by the engine fields.
    pub columns: Vec<String>,
}

impl OutputHeader {
    fn for_batch<R: Record>(batch_id: &str) -> Self {
        let mut columns: Vec<String> = R::columns().iter().map(|c| (*c).to_owned()).collect();
        columns.push("sourceInput".into());
        columns.push("retryDepth".into());
        Self {
            header: true,
            batch_id: batch_id.to_owned(),
            columns,
        }
    }
}

/// Flush thresholds and channel sizing.
#[derive(Debug, Clone, Copy)]
pub struct SinkSettings {
    /// Records buffered before a flush.
    pub flush_size: usize,
    /// Longest a record may sit in the buffer.
    pub flush_interval: Duration,
    /// Capacity of the submit channel before records spill to overflow.
    pub channel_capacity: usize,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            flush_size: 25,
            flush_interval: Duration::from_secs(8),
            channel_capacity: 1024,
        }
    }
}

/// Sink counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Records passed to `submit`.
    pub submitted: u64,
    /// Records written to disk.
    pub written: u64,
    /// Records dropped as duplicates.
    pub duplicates: u64,
    /// Records that went through the overflow buffer.
    pub overflowed: u64,
    /// Failed flush attempts.
    pub write_failures: u64,
    /// Successful flushes.
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    written: AtomicU64,
    duplicates: AtomicU64,
    overflowed: AtomicU64,
    write_failures: AtomicU64,
    flushes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// What [`ResultSink::close`] hands back.
#[derive(Debug, Clone, Default)]
pub struct SinkSummary {
    /// Final counters.
    pub stats: SinkStats,
    /// Every key seen, including keys loaded from an existing file.
    pub keys: HashSet<DedupKey>,
    /// Records still unwritten after the final flush.
    pub unwritten: usize,
}

enum Msg<R> {
    Record(OutputRecord<R>),
    Flush(Sender<Result<(), String>>),
    Close,
}

/// Handle used by the engine to submit records.
pub struct ResultSink<R: Record> {
    path: PathBuf,
    tx: Sender<Msg<R>>,
    overflow: Mutex<Vec<OutputRecord<R>>>,
    counters: Arc<Counters>,
    writer: Option<JoinHandle<(HashSet<DedupKey>, usize)>>,
}

impl<R: Record> ResultSink<R> {
    /// Open (or resume) the output file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the file cannot be read, created, or the
    /// writer thread cannot be spawned.
    pub fn open(path: impl AsRef<Path>, batch_id: &str, settings: SinkSettings) -> Result<Self, SinkError> {
        Self::open_seeded(path, batch_id, settings, HashSet::new())
    }

    /// Like [`Self::open`], with keys already written elsewhere treated as
    /// duplicates.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub fn open_seeded(
        path: impl AsRef<Path>,
        batch_id: &str,
        settings: SinkSettings,
        mut seen: HashSet<DedupKey>,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let existing = if path.exists() { read_records::<R>(&path)? } else { Vec::new() };
        let resumed = existing.len();
        seen.extend(existing.iter().map(OutputRecord::dedup_key));

        let empty = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            let header = serde_json::to_string(&OutputHeader::for_batch::<R>(batch_id))?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{header}")?;
        }
        info!(path = %path.display(), resumed, known_keys = seen.len(), "result sink opened");

        let (tx, rx) = bounded(settings.channel_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let writer = Writer {
            path: path.clone(),
            settings: SinkSettings {
                flush_size: settings.flush_size.max(1),
                ..settings
            },
            seen,
            buffer: Vec::new(),
            counters: Arc::clone(&counters),
        };
        let handle = thread::Builder::new()
            .name("harvest-sink".into())
            .spawn(move || writer.run(&rx))?;

        Ok(Self {
            path,
            tx,
            overflow: Mutex::new(Vec::new()),
            counters,
            writer: Some(handle),
        })
    }

    /// Output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a record. Never blocks: if the channel is full the record waits
    /// in an in-memory overflow buffer.
    pub fn submit(&self, record: OutputRecord<R>) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let mut overflow = self.overflow.lock();
        self.drain_overflow(&mut overflow);
        if !overflow.is_empty() {
            self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            overflow.push(record);
            return;
        }
        match self.tx.try_send(Msg::Record(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(Msg::Record(record))) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                overflow.push(record);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                warn!("sink writer gone, record dropped");
            }
        }
    }

    /// Push everything buffered to disk and wait for the result.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] if the writer exited, or
    /// [`SinkError::Io`] if the write failed (records stay buffered).
    pub fn flush(&self) -> Result<(), SinkError> {
        self.send_overflow()?;
        let (ack_tx, ack_rx) = bounded(1);
        self.tx.send(Msg::Flush(ack_tx)).map_err(|_| SinkError::Closed)?;
        match ack_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(SinkError::Io(std::io::Error::other(reason))),
            Err(_) => Err(SinkError::Closed),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }

    /// Flush, stop the writer, and return the final state.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] if the writer thread had already died.
    pub fn close(mut self) -> Result<SinkSummary, SinkError> {
        self.shutdown_writer()
    }

    fn shutdown_writer(&mut self) -> Result<SinkSummary, SinkError> {
        let Some(handle) = self.writer.take() else {
            return Err(SinkError::Closed);
        };
        let sent = self.send_overflow().and_then(|()| self.tx.send(Msg::Close).map_err(|_| SinkError::Closed));
        let joined = handle.join().map_err(|_| SinkError::Closed)?;
        sent?;
        let (keys, unwritten) = joined;
        let stats = self.counters.snapshot();
        info!(
            path = %self.path.display(),
            written = stats.written,
            duplicates = stats.duplicates,
            unwritten,
            "result sink closed"
        );
        Ok(SinkSummary { stats, keys, unwritten })
    }

    fn drain_overflow(&self, overflow: &mut Vec<OutputRecord<R>>) {
        if overflow.is_empty() {
            return;
        }
        let mut pending = std::mem::take(overflow).into_iter();
        while let Some(record) = pending.next() {
            match self.tx.try_send(Msg::Record(record)) {
                Ok(()) => {}
                Err(TrySendError::Full(Msg::Record(record))) => {
                    overflow.push(record);
                    overflow.extend(pending);
                    return;
                }
                Err(_) => return,
            }
        }
    }

    fn send_overflow(&self) -> Result<(), SinkError> {
        let pending = std::mem::take(&mut *self.overflow.lock());
        for record in pending {
            self.tx.send(Msg::Record(record)).map_err(|_| SinkError::Closed)?;
        }
        Ok(())
    }
}

impl<R: Record> Drop for ResultSink<R> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            let _ = self.shutdown_writer();
        }
    }
}

struct Writer<R> {
    path: PathBuf,
    settings: SinkSettings,
    seen: HashSet<DedupKey>,
    buffer: Vec<OutputRecord<R>>,
    counters: Arc<Counters>,
}

impl<R: Record> Writer<R> {
    fn run(mut self, rx: &Receiver<Msg<R>>) -> (HashSet<DedupKey>, usize) {
        debug!(path = %self.path.display(), "sink writer started");
        let mut deadline = Instant::now() + self.settings.flush_interval;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(Msg::Record(record)) => {
                    if self.accept(record) && self.buffer.len() >= self.settings.flush_size {
                        let _ = self.flush();
                        deadline = Instant::now() + self.settings.flush_interval;
                    }
                }
                Ok(Msg::Flush(ack)) => {
                    let _ = ack.send(self.flush());
                    deadline = Instant::now() + self.settings.flush_interval;
                }
                Ok(Msg::Close) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = self.flush();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.flush();
                    deadline = Instant::now() + self.settings.flush_interval;
                }
            }
        }
        let unwritten = self.buffer.len();
        if unwritten > 0 {
            warn!(unwritten, path = %self.path.display(), "sink closed with unwritten records");
        }
        (self.seen, unwritten)
    }

    fn accept(&mut self, record: OutputRecord<R>) -> bool {
        if self.seen.insert(record.dedup_key()) {
            self.buffer.push(record);
            true
        } else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn flush(&mut self) -> Result<(), String> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        match append_lines(&self.path, &self.buffer) {
            Ok(()) => {
                let n = self.buffer.len() as u64;
                self.buffer.clear();
                self.counters.written.fetch_add(n, Ordering::Relaxed);
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(records = n, "sink flushed");
                Ok(())
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, buffered = self.buffer.len(), "sink flush failed, keeping buffer");
                Err(e.to_string())
            }
        }
    }
}

fn append_lines<R: Serialize>(path: &Path, records: &[OutputRecord<R>]) -> Result<(), SinkError> {
    let mut body = String::new();
    for record in records {
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn is_header(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("header").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

/// Read every record from an output file, skipping headers. Malformed lines
/// (e.g. a torn final write) are logged and skipped.
///
/// # Errors
///
/// Returns [`SinkError::Io`] if the file cannot be read.
pub fn read_records<R: Record>(path: &Path) -> Result<Vec<OutputRecord<R>>, SinkError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || is_header(&line) {
            continue;
        }
        match serde_json::from_str::<OutputRecord<R>>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), line = line_no + 1, error = %e, "skipping malformed output line"),
        }
    }
    Ok(records)
}

/// Result of [`dedupe_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupeStats {
    /// Records kept.
    pub kept: usize,
    /// Duplicates removed.
    pub removed: usize,
}

/// Rewrite `path` keeping the first occurrence of each key. The header line
/// is preserved; the rewrite goes through a temp file and rename.
///
/// # Errors
///
/// Returns [`SinkError`] on any read or write failure; the original file is
/// untouched in that case.
pub fn dedupe_file<R: Record>(path: &Path) -> Result<DedupeStats, SinkError> {
    let header = BufReader::new(File::open(path)?)
        .lines()
        .next()
        .transpose()?
        .filter(|line| is_header(line));
    let records = read_records::<R>(path)?;
    let total = records.len();

    let mut seen = HashSet::with_capacity(total);
    let kept: Vec<_> = records.into_iter().filter(|r| seen.insert(r.dedup_key())).collect();
    let stats = DedupeStats {
        kept: kept.len(),
        removed: total - kept.len(),
    };
    if stats.removed == 0 {
        return Ok(stats);
    }

    let tmp = path.with_extension(format!("dedupe-{}.tmp", uuid::Uuid::new_v4()));
    let write = || -> Result<(), SinkError> {
        let mut file = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
        if let Some(header) = &header {
            writeln!(file, "{header}")?;
        }
        for record in &kept {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    info!(path = %path.display(), kept = stats.kept, removed = stats.removed, "output de-duplicated");
    Ok(stats)
}
