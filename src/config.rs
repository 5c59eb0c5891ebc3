//! Runtime configuration for the delegation mesh.
//!
//! [`MeshConfig`] is the exhaustive knob surface of the core. Every field
//! has a sensible default; embedders override what they need with the
//! builder-style `with_*` methods. Process-level defaults (bind address,
//! journal path, API token) come from the environment via
//! [`ProcessConfig::from_env`].

use std::path::PathBuf;

/// How the journal reacts to a broken hash chain on init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Keep the longest valid prefix, rewrite the file, continue.
    Truncate,
    /// Refuse to init on any integrity violation.
    Strict,
}

/// Journal-specific knobs.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub path: PathBuf,
    /// LRU cap on the in-memory per-session index.
    pub max_sessions_indexed: usize,
    /// Fsync after every append.
    pub fsync: bool,
    /// Take an advisory lockfile on init.
    pub lock: bool,
    /// Redact sensitive payload fields before persistence.
    pub redact: bool,
    pub recovery: RecoveryMode,
}

impl JournalConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weavemesh.journal.jsonl"),
            max_sessions_indexed: 10_000,
            fsync: false,
            lock: true,
            redact: true,
            recovery: RecoveryMode::Truncate,
        }
    }
}

/// The full configuration surface of the delegation safety core.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    // Peer FSM timers.
    pub heartbeat_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub suspected_after_ms: u64,
    pub unreachable_after_ms: u64,
    pub evict_after_ms: u64,

    /// Default outer deadline for dispatched tasks.
    pub delegation_timeout_ms: u64,

    // Escrow policy.
    pub min_bond_usd: f64,
    /// Fraction of the held bond slashed on an SLO violation, in [0,1].
    pub slash_pct_on_violation: f64,
    /// Fraction of the held bond slashed on a timeout, in [0,1].
    pub slash_pct_on_timeout: f64,

    /// If true the outcome verifier fails on any SLO miss.
    pub slo_strict: bool,

    // Consensus defaults.
    pub required_voters: usize,
    pub required_agreement: f64,

    // Anomaly detection.
    pub failure_rate_threshold: f64,
    pub failure_rate_window: usize,
    pub duration_spike_threshold: f64,
    pub cost_spike_threshold: f64,

    // Re-delegation.
    pub max_redelegations: u32,
    pub redelegation_cooldown_ms: u64,

    // Task decomposition.
    pub complexity_floor_words: usize,
    pub max_sub_tasks: usize,

    // Auctions.
    pub default_bid_deadline_ms: u64,
    pub min_bids_to_award: usize,

    // Sybil defense.
    pub max_joins_in_window: usize,
    pub join_window_ms: u64,
    pub pow_difficulty: usize,
    pub require_proof_of_work: bool,

    pub journal: JournalConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            sweep_interval_ms: 2_000,
            suspected_after_ms: 15_000,
            unreachable_after_ms: 45_000,
            evict_after_ms: 300_000,
            delegation_timeout_ms: 120_000,
            min_bond_usd: 0.01,
            slash_pct_on_violation: 0.5,
            slash_pct_on_timeout: 0.25,
            slo_strict: true,
            required_voters: 2,
            required_agreement: 0.67,
            failure_rate_threshold: 0.4,
            failure_rate_window: 20,
            duration_spike_threshold: 2.0,
            cost_spike_threshold: 2.0,
            max_redelegations: 3,
            redelegation_cooldown_ms: 1_000,
            complexity_floor_words: 20,
            max_sub_tasks: 8,
            default_bid_deadline_ms: 5_000,
            min_bids_to_award: 1,
            max_joins_in_window: 5,
            join_window_ms: 60_000,
            pow_difficulty: 4,
            require_proof_of_work: false,
            journal: JournalConfig::default(),
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub fn with_journal(mut self, journal: JournalConfig) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub fn with_slo_strict(mut self, strict: bool) -> Self {
        self.slo_strict = strict;
        self
    }

    #[must_use]
    pub fn with_proof_of_work(mut self, difficulty: usize) -> Self {
        self.require_proof_of_work = true;
        self.pow_difficulty = difficulty;
        self
    }
}

/// Process-level defaults resolved from the environment.
///
/// Each variable has a documented fallback so a bare process starts
/// without any environment at all:
///
/// | Variable | Default |
/// |---|---|
/// | `WEAVEMESH_API_TOKEN` | none (authentication disabled) |
/// | `WEAVEMESH_BIND_ADDR` | `127.0.0.1` |
/// | `WEAVEMESH_PORT` | `7437` |
/// | `WEAVEMESH_JOURNAL_PATH` | `weavemesh.journal.jsonl` |
/// | `WEAVEMESH_CHECKPOINT_DIR` | `checkpoints` |
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub api_token: Option<String>,
    pub bind_addr: String,
    pub port: u16,
    pub journal_path: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            api_token: std::env::var("WEAVEMESH_API_TOKEN").ok(),
            bind_addr: std::env::var("WEAVEMESH_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("WEAVEMESH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(7437),
            journal_path: std::env::var("WEAVEMESH_JOURNAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("weavemesh.journal.jsonl")),
            checkpoint_dir: std::env::var("WEAVEMESH_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("checkpoints")),
        }
    }
}
