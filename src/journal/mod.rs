//! Append-only hash-chained event log on local durable storage.
//!
//! One JSON record per line. Every record's `hash_prev` is the SHA-256 of
//! the previous persisted line, so local ordering is witnessed by the file
//! itself. The journal is the durability substrate the rest of the core
//! leans on: escrow, reputation, auctions, and anomaly reports all emit
//! here, and in-process subscribers observe the stream live.
//!
//! Writes are serialized through a single mutex and protected against
//! concurrent processes by an advisory lock plus a `.lock` PID sidecar.
//! Recovery trims torn writes and (in the default `Truncate` mode) cuts
//! the file back to its longest chain-valid prefix.

pub mod event;
pub mod redact;

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{JournalConfig, RecoveryMode};
pub use event::{EventKind, JournalEvent, chain_hash};
pub use redact::{REDACTED, redact_value};

/// Errors from journal operations.
#[derive(Debug, Error, Diagnostic)]
pub enum JournalError {
    /// Another live process owns the journal.
    #[error("journal is locked by live process {pid}")]
    #[diagnostic(
        code(weavemesh::journal::locked),
        help("Stop the process holding the lock, or point this node at a different journal path.")
    )]
    Locked { pid: u32 },

    /// The hash chain or sequence numbering is broken and recovery mode is strict.
    #[error("journal integrity violation at seq {seq}: {detail}")]
    #[diagnostic(
        code(weavemesh::journal::integrity),
        help("Re-open with RecoveryMode::Truncate to keep the longest valid prefix.")
    )]
    IntegrityViolation { seq: u64, detail: String },

    /// The backing device has no space for another record.
    #[error("journal append failed: storage full")]
    #[diagnostic(code(weavemesh::journal::disk_full))]
    DiskFull,

    #[error("journal I/O error")]
    #[diagnostic(code(weavemesh::journal::io))]
    Io(#[from] std::io::Error),

    #[error("journal serialization error")]
    #[diagnostic(code(weavemesh::journal::serde))]
    Serialization(#[from] serde_json::Error),
}

/// Result of a journal health probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalHealth {
    pub writable: bool,
    pub disk_usage_bytes: u64,
}

/// Options for [`Journal::read_session`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    pub offset: usize,
    pub limit: Option<usize>,
}

struct SessionEntry {
    events: Vec<JournalEvent>,
    touched: u64,
}

/// In-memory per-session index with an LRU cap on session count.
struct SessionIndex {
    cap: usize,
    clock: u64,
    sessions: FxHashMap<String, SessionEntry>,
}

impl SessionIndex {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            clock: 0,
            sessions: FxHashMap::default(),
        }
    }

    fn insert(&mut self, event: JournalEvent) {
        self.clock += 1;
        let touched = self.clock;
        let entry = self
            .sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionEntry {
                events: Vec::new(),
                touched,
            });
        entry.events.push(event);
        entry.touched = touched;
        self.evict_over_cap();
    }

    fn evict_over_cap(&mut self) {
        while self.sessions.len() > self.cap {
            if let Some(oldest) = self
                .sessions
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone())
            {
                self.sessions.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn get(&mut self, session_id: &str) -> Option<&[JournalEvent]> {
        self.clock += 1;
        let clock = self.clock;
        self.sessions.get_mut(session_id).map(|entry| {
            entry.touched = clock;
            entry.events.as_slice()
        })
    }

    fn repopulate(&mut self, session_id: &str, events: Vec<JournalEvent>) {
        self.clock += 1;
        let touched = self.clock;
        self.sessions
            .insert(session_id.to_string(), SessionEntry { events, touched });
        self.evict_over_cap();
    }

    fn clear(&mut self) {
        self.sessions.clear();
    }
}

struct JournalInner {
    file: File,
    next_seq: u64,
    last_hash: Option<String>,
    index: SessionIndex,
}

/// The append-only event log.
pub struct Journal {
    config: JournalConfig,
    inner: Mutex<JournalInner>,
    subscribers: Mutex<Vec<flume::Sender<JournalEvent>>>,
    lockfile: Option<PathBuf>,
}

impl Journal {
    /// Open (or create) the journal at the configured path and recover it.
    ///
    /// Acquires the PID lockfile and an advisory exclusive lock on the
    /// journal file when `config.lock` is set. A stale lockfile whose
    /// holder is no longer alive is cleaned up silently.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        let lockfile = if config.lock {
            Some(acquire_lockfile(&config.path)?)
        } else {
            None
        };
        let release_lockfile = || {
            if let Some(path) = &lockfile {
                let _ = fs::remove_file(path);
            }
        };

        let recovered = match recover_file(&config.path, config.recovery) {
            Ok(recovered) => recovered,
            Err(err) => {
                release_lockfile();
                return Err(err);
            }
        };

        let file = match OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&config.path)
        {
            Ok(file) => file,
            Err(err) => {
                release_lockfile();
                return Err(err.into());
            }
        };
        if config.lock && file.try_lock_exclusive().is_err() {
            // The PID lockfile was won, so the only live holder of the
            // advisory lock is another journal in this same process.
            release_lockfile();
            return Err(JournalError::Locked {
                pid: std::process::id(),
            });
        }

        let mut index = SessionIndex::new(config.max_sessions_indexed);
        for event in &recovered.events {
            index.insert(event.clone());
        }

        debug!(
            path = %config.path.display(),
            events = recovered.events.len(),
            truncated = recovered.rewritten,
            "journal opened"
        );

        Ok(Self {
            inner: Mutex::new(JournalInner {
                file,
                next_seq: recovered.events.len() as u64,
                last_hash: recovered.last_hash,
                index,
            }),
            subscribers: Mutex::new(Vec::new()),
            config,
            lockfile,
        })
    }

    /// Append one event: assign the next seq, chain it to the previous
    /// record, persist (optionally fsync'd), and fan out to subscribers.
    ///
    /// A failing or disconnected subscriber never aborts the emit.
    pub fn emit(
        &self,
        session_id: impl Into<String>,
        kind: EventKind,
        mut payload: serde_json::Value,
    ) -> Result<JournalEvent, JournalError> {
        if self.config.redact {
            redact_value(&mut payload);
        }

        let event = {
            let mut inner = self.inner.lock();
            let event = JournalEvent::next(
                session_id,
                inner.next_seq,
                kind,
                payload,
                inner.last_hash.clone(),
            );
            let line = event.canonical_line()?;

            if let Err(err) = writeln!(inner.file, "{line}") {
                if err.kind() == std::io::ErrorKind::StorageFull {
                    return Err(JournalError::DiskFull);
                }
                return Err(err.into());
            }
            if self.config.fsync {
                inner.file.sync_data()?;
            }

            inner.last_hash = Some(chain_hash(&line));
            inner.next_seq += 1;
            inner.index.insert(event.clone());
            event
        };

        self.fan_out(&event);
        Ok(event)
    }

    /// Best-effort emit: on failure the event is dropped and logged
    /// instead of surfacing to the caller. For non-essential events when
    /// the disk may be full.
    pub fn try_emit(
        &self,
        session_id: impl Into<String>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Option<JournalEvent> {
        match self.emit(session_id, kind, payload) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(error = %err, "dropping journal event");
                None
            }
        }
    }

    /// Register an in-process subscriber. Every subsequent emit is sent to
    /// the returned channel; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> flume::Receiver<JournalEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn fan_out(&self, event: &JournalEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Events for one session, in emission order, honoring offset/limit.
    ///
    /// Served from the in-memory index; a session evicted by the LRU cap
    /// is transparently re-read from the file.
    pub fn read_session(
        &self,
        session_id: &str,
        opts: ReadOptions,
    ) -> Result<Vec<JournalEvent>, JournalError> {
        let mut inner = self.inner.lock();
        if inner.index.get(session_id).is_none() {
            let events = scan_session(&self.config.path, session_id)?;
            inner.index.repopulate(session_id, events);
        }
        let events = inner.index.get(session_id).unwrap_or(&[]);
        let limit = opts.limit.unwrap_or(usize::MAX);
        Ok(events
            .iter()
            .skip(opts.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Lazily iterate every event in the file, in order.
    pub fn iter_all(&self) -> Result<JournalIter, JournalError> {
        // Hold no lock while the caller drains; appends during iteration
        // are simply not observed.
        let file = File::open(&self.config.path)?;
        Ok(JournalIter {
            lines: BufReader::new(file).lines(),
        })
    }

    /// Total number of events persisted.
    pub fn len(&self) -> u64 {
        self.inner.lock().next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the journal keeping only the named sessions.
    ///
    /// Seq values are renumbered from zero and the hash chain recomputed,
    /// so the retained subset remains a valid journal. The rewrite goes
    /// through a temp file and an atomic rename.
    pub fn compact<I, S>(&self, retain_sessions: I) -> Result<(), JournalError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let retain: rustc_hash::FxHashSet<String> =
            retain_sessions.into_iter().map(Into::into).collect();

        let mut inner = self.inner.lock();

        let mut kept = Vec::new();
        {
            let file = File::open(&self.config.path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: JournalEvent = serde_json::from_str(&line)?;
                if retain.contains(&event.session_id) {
                    kept.push(event);
                }
            }
        }

        let tmp_path = self.config.path.with_extension("jsonl.tmp");
        let mut last_hash: Option<String> = None;
        {
            let mut tmp = File::create(&tmp_path)?;
            for (seq, event) in kept.iter_mut().enumerate() {
                event.seq = seq as u64;
                event.hash_prev = last_hash.take();
                let line = event.canonical_line()?;
                writeln!(tmp, "{line}")?;
                last_hash = Some(chain_hash(&line));
            }
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.config.path)?;

        // Reopen the append handle against the renamed file.
        let file = OpenOptions::new().append(true).read(true).open(&self.config.path)?;
        if self.config.lock {
            let _ = file.try_lock_exclusive();
        }
        inner.file = file;
        inner.next_seq = kept.len() as u64;
        inner.last_hash = last_hash;
        inner.index.clear();
        for event in kept {
            inner.index.insert(event);
        }
        Ok(())
    }

    /// Probe whether the journal can still accept appends and how much
    /// space it occupies.
    pub fn health(&self) -> JournalHealth {
        let inner = self.inner.lock();
        let disk_usage_bytes = inner.file.metadata().map(|m| m.len()).unwrap_or(0);
        let writable = inner.file.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false);
        JournalHealth {
            writable,
            disk_usage_bytes,
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Some(path) = &self.lockfile {
            let _ = fs::remove_file(path);
        }
    }
}

/// Lazy line-by-line reader over the whole journal.
pub struct JournalIter {
    lines: std::io::Lines<BufReader<File>>,
}

impl Iterator for JournalIter {
    type Item = Result<JournalEvent, JournalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(JournalError::from));
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

struct Recovered {
    events: Vec<JournalEvent>,
    last_hash: Option<String>,
    rewritten: bool,
}

/// Validate the file's chain and trim it back to the longest valid prefix.
fn recover_file(path: &Path, mode: RecoveryMode) -> Result<Recovered, JournalError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Recovered {
                events: Vec::new(),
                last_hash: None,
                rewritten: false,
            });
        }
        Err(err) => return Err(err.into()),
    };

    let lines: Vec<&str> = content.lines().collect();
    let mut valid_lines: Vec<&str> = Vec::new();
    let mut events: Vec<JournalEvent> = Vec::new();
    let mut prev_hash: Option<String> = None;
    let mut defect: Option<(u64, String)> = None;

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: JournalEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) if idx == lines.len() - 1 => {
                // Torn final write from a crash mid-append.
                defect = Some((idx as u64, "partial trailing record".to_string()));
                break;
            }
            Err(err) => {
                defect = Some((idx as u64, format!("unparseable record: {err}")));
                break;
            }
        };

        if event.seq != events.len() as u64 {
            defect = Some((
                event.seq,
                format!("expected seq {}, found {}", events.len(), event.seq),
            ));
            break;
        }
        if event.hash_prev != prev_hash {
            defect = Some((event.seq, "hash_prev does not match prior record".to_string()));
            break;
        }

        prev_hash = Some(chain_hash(line));
        valid_lines.push(line);
        events.push(event);
    }

    let rewritten = match (&defect, mode) {
        (None, _) => false,
        (Some((seq, detail)), RecoveryMode::Strict) => {
            return Err(JournalError::IntegrityViolation {
                seq: *seq,
                detail: detail.clone(),
            });
        }
        (Some((seq, detail)), RecoveryMode::Truncate) => {
            warn!(seq, detail = %detail, kept = events.len(), "truncating journal to valid prefix");
            let tmp_path = path.with_extension("jsonl.tmp");
            {
                let mut tmp = File::create(&tmp_path)?;
                for line in &valid_lines {
                    writeln!(tmp, "{line}")?;
                }
                tmp.sync_data()?;
            }
            fs::rename(&tmp_path, path)?;
            true
        }
    };

    Ok(Recovered {
        events,
        last_hash: prev_hash,
        rewritten,
    })
}

/// Scan the file for one session's events (index-miss fallback).
fn scan_session(path: &Path, session_id: &str) -> Result<Vec<JournalEvent>, JournalError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: JournalEvent = serde_json::from_str(&line)?;
        if event.session_id == session_id {
            events.push(event);
        }
    }
    Ok(events)
}

fn lockfile_path(journal_path: &Path) -> PathBuf {
    let mut name = journal_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "journal".to_string());
    name.push_str(".lock");
    journal_path.with_file_name(name)
}

fn acquire_lockfile(journal_path: &Path) -> Result<PathBuf, JournalError> {
    let path = lockfile_path(journal_path);
    if let Ok(existing) = fs::read_to_string(&path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if pid_alive(pid) && pid != std::process::id() {
                return Err(JournalError::Locked { pid });
            }
        }
        // Stale or unreadable holder.
        let _ = fs::remove_file(&path);
    }
    fs::write(&path, std::process::id().to_string())?;
    Ok(path)
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, assume the holder is alive and
    // let the operator remove the lockfile manually.
    true
}
