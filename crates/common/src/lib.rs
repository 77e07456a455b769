
pub mod batch;
pub mod details;
pub mod memory;

pub use batch::{ChunkAllocator, ChunkSizes, RowBatch};
pub use details::{CommitDetails, ExecDetails, LockKeysDetails, StmtExecDetails};
pub use memory::MemoryTracker;

use serde::{Deserialize, Serialize};
use std::{fmt, io, time::Duration};
use thiserror::Error;
use types::{SqlType, Value};

/// Logical identifier for a table registered in the catalog.
/// Examples:
/// - `let users = TableId(7);`
/// - `let orders = TableId(11);`
/// - `let system_tables = TableId(0);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Positional row representation backed by `types::Value`.
/// Examples:
/// - `let row = Row::new(vec![Value::Int(1)]);`
/// - `let row = Row::new(vec![Value::Text("alice".into()), Value::Bool(true)]);`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

/// One output column of an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    pub ty: SqlType,
}

impl SchemaColumn {
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Declared output schema of an operator tree. An empty schema marks a
/// statement with no client-visible rows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<SchemaColumn>,
}

impl Schema {
    pub fn new(columns: Vec<SchemaColumn>) -> Self {
        Self { columns }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Why a session refuses writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOnlyReason {
    /// Session pinned to a historical snapshot timestamp.
    SnapshotTs,
    /// Session reads at a coarse, low-resolution timestamp.
    LowResolutionTs,
}

impl fmt::Display for ReadOnlyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadOnlyReason::SnapshotTs => f.write_str("snapshot_ts"),
            ReadOnlyReason::LowResolutionTs => f.write_str("low_resolution_ts"),
        }
    }
}

/// Canonical error type shared across database subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("plan: {0}")]
    Planner(String),
    #[error("build: {0}")]
    Build(String),
    #[error("exec: {0}")]
    Executor(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error(
        "write conflict, txnStartTS={start_ts}, conflictStartTS={conflict_start_ts}, conflictCommitTS={conflict_commit_ts}, key={key}"
    )]
    WriteConflict {
        start_ts: u64,
        conflict_start_ts: u64,
        conflict_commit_ts: u64,
        key: String,
    },
    #[error("duplicate entry '{0}'")]
    KeyExists(String),
    #[error("lock wait timeout exceeded; try restarting transaction")]
    LockWaitTimeout,
    /// Raw deadlock signal reported by the lock client.
    #[error("deadlock detected: lock_ts={lock_ts}, lock_key={lock_key}, deadlock_key_hash={deadlock_key_hash}")]
    KvDeadlock {
        lock_ts: u64,
        lock_key: String,
        deadlock_key_hash: u64,
    },
    #[error("deadlock found when trying to get lock; try restarting transaction")]
    Deadlock,
    #[error("pessimistic lock retry limit reached (max {max_retries})")]
    RetryBudgetExceeded { max_retries: u32 },
    #[error("can not execute write statement when '{0}' is set")]
    ReadOnlyViolation(ReadOnlyReason),
    #[error("query execution was interrupted")]
    Cancelled,
    #[error("query execution was interrupted, maximum statement execution time exceeded")]
    DeadlineExceeded,
    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),
    #[error("internal: {message}")]
    Internal { message: String, backtrace: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification used by callers for reporting and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Planning,
    Build,
    Execution,
    LockConflict,
    Deadlock,
    RetryBudgetExceeded,
    ReadOnlyViolation,
    Cancelled,
    ResourceExceeded,
    Internal,
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Planner(_) => ErrorKind::Planning,
            DbError::Build(_) => ErrorKind::Build,
            DbError::Executor(_) | DbError::Storage(_) | DbError::Io(_) => ErrorKind::Execution,
            DbError::WriteConflict { .. } | DbError::KeyExists(_) | DbError::LockWaitTimeout => {
                ErrorKind::LockConflict
            }
            DbError::KvDeadlock { .. } | DbError::Deadlock => ErrorKind::Deadlock,
            DbError::RetryBudgetExceeded { .. } => ErrorKind::RetryBudgetExceeded,
            DbError::ReadOnlyViolation(_) => ErrorKind::ReadOnlyViolation,
            DbError::Cancelled | DbError::DeadlineExceeded => ErrorKind::Cancelled,
            DbError::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            DbError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Errors the pessimistic retry loop may recover from.
    pub fn is_lock_conflict(&self) -> bool {
        self.kind() == ErrorKind::LockConflict
    }

    /// Errors that end the statement no matter what the transaction manager says.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Deadlock | ErrorKind::Cancelled | ErrorKind::ResourceExceeded
        )
    }

    /// Short label used for error metrics.
    pub fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Planning => "planning",
            ErrorKind::Build => "build",
            ErrorKind::Execution => "execution",
            ErrorKind::LockConflict => "lock_conflict",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::RetryBudgetExceeded => "retry_limit",
            ErrorKind::ReadOnlyViolation => "read_only",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for statement execution.
///
/// # Example
/// ```
/// use common::Config;
/// use std::time::Duration;
///
/// let config = Config::builder()
///     .max_retry_count(16)
///     .slow_threshold(Duration::from_millis(100))
///     .build();
/// assert_eq!(config.max_chunk_size, 1024);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
#[serde(default)]
pub struct Config {
    /// Upper bound on pessimistic lock retries for one statement.
    #[builder(default = 256)]
    pub max_retry_count: u32,
    /// Default wait for row locks when the session sets none.
    #[builder(default = Duration::from_secs(50))]
    pub lock_wait_timeout: Duration,
    /// First batch capacity handed to an operator.
    #[builder(default = 32)]
    pub init_chunk_size: usize,
    /// Batch capacity ceiling.
    #[builder(default = 1024)]
    pub max_chunk_size: usize,
    #[builder(default = true)]
    pub enable_slow_log: bool,
    #[builder(default = Duration::from_millis(300))]
    pub slow_threshold: Duration,
    /// Emit the slow log for every statement (verbose tracing).
    #[builder(default = false)]
    pub force_slow_log: bool,
    #[builder(default = true)]
    pub record_plan_in_slow_log: bool,
    /// SQL text longer than this is truncated in logs; 0 disables truncation.
    #[builder(default = 4096)]
    pub query_log_max_len: usize,
    #[builder(default = true)]
    pub stmt_summary_enabled: bool,
    /// Also summarize internal (restricted) statements.
    #[builder(default = false)]
    pub stmt_summary_internal: bool,
    #[builder(default = 3000)]
    pub stmt_summary_max_entries: usize,
    #[builder(default = 500)]
    pub slow_query_ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Parse a (possibly partial) JSON document; absent fields keep their defaults.
    pub fn from_json(raw: &str) -> DbResult<Self> {
        serde_json::from_str(raw).map_err(|e| DbError::Executor(format!("invalid config: {e}")))
    }

    pub fn chunk_sizes(&self) -> ChunkSizes {
        ChunkSizes {
            init_cap: self.init_chunk_size.min(self.max_chunk_size),
            max: self.max_chunk_size,
        }
    }
}

/// Formats duration in human-readable form (e.g., "123.45ms", "1.234s")
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1000 {
        format!("{micros}µs")
    } else if micros < 1_000_000 {
        format!("{:.2}ms", micros as f64 / 1000.0)
    } else {
        format!("{:.3}s", micros as f64 / 1_000_000.0)
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        Config, DbError, DbResult, ErrorKind, Row, RowBatch, Schema, SchemaColumn, TableId,
    };
    pub use types::{SqlType, Value};
}
