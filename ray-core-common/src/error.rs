//! Error taxonomy (spec.md §7) and fatal-abort conditions.

use thiserror::Error;

/// Observable failure kinds propagated to task waiters. These are the
/// sentinel kinds stored into `MemoryStore` under a task's return ids (see
/// `ray-core-worker::services::task_manager`).
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RayCoreError {
    #[error("object unreconstructable: lineage exhausted or disabled for {0}")]
    ObjectUnreconstructable(String),

    #[error("leased worker died: {0}")]
    WorkerDied(String),

    #[error("actor died permanently: {0}")]
    ActorDied(String),

    #[error("task cancelled before dispatch: {0}")]
    TaskCancelled(String),

    #[error("owner of referenced object is gone: {0}")]
    OwnerDied(String),

    #[error("transient failure, retry eligible: {0}")]
    Transient(String),

    #[error("rpc failure: {0}")]
    Rpc(String),

    #[error("io failure: {0}")]
    Io(String),
}

impl RayCoreError {
    /// Whether the client-call layer should retry this failure with capped
    /// exponential backoff (spec.md §7 "Propagation").
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, RayCoreError::Transient(_) | RayCoreError::Rpc(_))
    }
}

impl From<std::io::Error> for RayCoreError {
    fn from(e: std::io::Error) -> Self {
        RayCoreError::Io(e.to_string())
    }
}

impl From<tonic::Status> for RayCoreError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
                RayCoreError::Transient(status.message().to_string())
            }
            _ => RayCoreError::Rpc(status.message().to_string()),
        }
    }
}

/// Process-level abort conditions (spec.md §7 "Fatal conditions"): version
/// mismatch with the store daemon, id-byte-length mismatch, and invariant
/// violations in the refcount tables. These never propagate as `Result`s —
/// by the time one is observed the in-process state is no longer trustworthy.
#[derive(Debug)]
pub enum FatalError {
    InvalidIdLength {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },
    StoreDaemonVersionMismatch {
        expected: i64,
        actual: i64,
    },
    InvariantViolation(String),
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalError::InvalidIdLength {
                type_name,
                expected,
                actual,
            } => write!(
                f,
                "{type_name}::from_binary: expected {expected} bytes, got {actual}"
            ),
            FatalError::StoreDaemonVersionMismatch { expected, actual } => write!(
                f,
                "object store daemon protocol version mismatch: expected {expected}, got {actual}"
            ),
            FatalError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl FatalError {
    /// Logs the condition and aborts the process. Never returns.
    #[cold]
    pub fn abort(self) -> ! {
        tracing::error!(error = %self, "fatal condition, aborting process");
        std::process::abort()
    }
}
