//! Errors surfaced by block execution.

use crate::types::TxnIndex;

/// Boxed error returned by an apply callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for the executor crate.
pub type Result<T, E = StmError> = std::result::Result<T, E>;

/// Fatal block execution errors.
///
/// Conflicts between speculative attempts are not errors; they are resolved
/// internally by re-execution and never reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum StmError {
    /// The apply callback reported a fatal condition. The whole block is aborted.
    #[error("apply callback failed for transaction {txn_idx}: {source}")]
    ApplyFailure {
        txn_idx: TxnIndex,
        #[source]
        source: BoxError,
    },

    /// A journal or merge invariant was broken by the caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Execution was cancelled by the caller before the final merge.
    #[error("block execution cancelled")]
    Cancelled,

    /// A worker thread panicked while executing a transaction.
    #[error("worker thread panicked")]
    WorkerPanicked,
}

impl StmError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        StmError::InvariantViolation(msg.into())
    }

    /// Returns true if the error comes from the apply callback.
    pub fn is_apply_failure(&self) -> bool {
        matches!(self, StmError::ApplyFailure { .. })
    }
}
