//! Durable per-task checkpoints.
//!
//! Workers snapshot long-running tasks so the originator can resume a
//! delegation after a peer dies mid-flight. Each task keeps a FIFO of at
//! most [`MAX_CHECKPOINTS_PER_TASK`] checkpoints; the file is JSONL, one
//! checkpoint per line, reloaded on init.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::journal::{EventKind, Journal};
use crate::types::Finding;

/// FIFO cap per task; the oldest checkpoint falls off on overflow.
pub const MAX_CHECKPOINTS_PER_TASK: usize = 10;

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint file I/O error")]
    #[diagnostic(code(weavemesh::checkpoint::io))]
    Io(#[from] std::io::Error),

    #[error("checkpoint record is malformed")]
    #[diagnostic(
        code(weavemesh::checkpoint::corrupt),
        help("Delete the checkpoint file to start clean; running tasks will re-checkpoint.")
    )]
    Corrupt(#[from] serde_json::Error),
}

/// A snapshot of a task's progress on a worker peer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskCheckpoint {
    pub checkpoint_id: String,
    pub task_id: String,
    pub peer_node_id: String,
    /// Opaque worker state; the core never interprets it.
    pub state: serde_json::Value,
    pub findings_so_far: Vec<Finding>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl TaskCheckpoint {
    pub fn new(
        task_id: impl Into<String>,
        peer_node_id: impl Into<String>,
        state: serde_json::Value,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            peer_node_id: peer_node_id.into(),
            state,
            findings_so_far: Vec::new(),
            tokens_used: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_progress(
        mut self,
        findings: Vec<Finding>,
        tokens_used: u64,
        cost_usd: f64,
        duration_ms: u64,
    ) -> Self {
        self.findings_so_far = findings;
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self.duration_ms = duration_ms;
        self
    }
}

/// File-backed store of task checkpoints with a per-task FIFO cap.
pub struct CheckpointStore {
    path: PathBuf,
    tasks: Mutex<FxHashMap<String, VecDeque<TaskCheckpoint>>>,
    journal: Option<Arc<Journal>>,
}

impl CheckpointStore {
    /// Open the store, reloading any checkpoints already on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let mut tasks: FxHashMap<String, VecDeque<TaskCheckpoint>> = FxHashMap::default();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let checkpoint: TaskCheckpoint = serde_json::from_str(&line)?;
                let entry = tasks.entry(checkpoint.task_id.clone()).or_default();
                entry.push_back(checkpoint);
                if entry.len() > MAX_CHECKPOINTS_PER_TASK {
                    entry.pop_front();
                }
            }
        } else if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
            journal: None,
        })
    }

    /// Emit a `checkpoint_saved` journal event per save.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Append a checkpoint, evicting the oldest when the task's FIFO is
    /// full. Eviction rewrites the file so the cap holds on disk too.
    pub fn save(&self, checkpoint: TaskCheckpoint) -> Result<(), CheckpointError> {
        {
            let mut tasks = self.tasks.lock();
            let evicted = {
                let entry = tasks.entry(checkpoint.task_id.clone()).or_default();
                entry.push_back(checkpoint.clone());
                if entry.len() > MAX_CHECKPOINTS_PER_TASK {
                    entry.pop_front();
                    true
                } else {
                    false
                }
            };
            if evicted {
                self.rewrite_locked(&tasks)?;
            } else {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                writeln!(file, "{}", serde_json::to_string(&checkpoint)?)?;
            }
        }

        if let Some(journal) = &self.journal {
            journal.try_emit(
                &checkpoint.task_id,
                EventKind::CheckpointSaved,
                json!({
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "task_id": checkpoint.task_id,
                    "peer_node_id": checkpoint.peer_node_id,
                    "duration_ms": checkpoint.duration_ms,
                }),
            );
        }
        Ok(())
    }

    fn rewrite_locked(
        &self,
        tasks: &FxHashMap<String, VecDeque<TaskCheckpoint>>,
    ) -> Result<(), CheckpointError> {
        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for deque in tasks.values() {
                for checkpoint in deque {
                    writeln!(tmp, "{}", serde_json::to_string(checkpoint)?)?;
                }
            }
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// True iff at least one checkpoint exists for the task.
    pub fn can_resume(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .get(task_id)
            .is_some_and(|d| !d.is_empty())
    }

    /// The most recent checkpoint for a task.
    pub fn latest(&self, task_id: &str) -> Option<TaskCheckpoint> {
        self.tasks
            .lock()
            .get(task_id)
            .and_then(|d| d.back().cloned())
    }

    /// All checkpoints for a task, oldest first.
    pub fn history(&self, task_id: &str) -> Vec<TaskCheckpoint> {
        self.tasks
            .lock()
            .get(task_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a task's checkpoints (delegation finished or abandoned).
    pub fn finalize(&self, task_id: &str) -> Result<(), CheckpointError> {
        let mut tasks = self.tasks.lock();
        if tasks.remove(task_id).is_some() {
            self.rewrite_locked(&tasks)?;
        }
        Ok(())
    }
}
