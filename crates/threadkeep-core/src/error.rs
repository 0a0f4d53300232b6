use std::fmt;
use thiserror::Error;

/// A convenience `Result` alias using [`ThreadkeepError`].
pub type ThreadkeepResult<T> = Result<T, ThreadkeepError>;

/// The sub-step of a commit that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStep {
    /// Reading the state the commit builds on.
    Load,
    /// Writing the write-ahead pending write.
    PendingWrite,
    /// Writing the consolidated checkpoint.
    Checkpoint,
}

impl fmt::Display for CommitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitStep::Load => f.write_str("load"),
            CommitStep::PendingWrite => f.write_str("pending write"),
            CommitStep::Checkpoint => f.write_str("checkpoint"),
        }
    }
}

/// Top-level error type for threadkeep.
///
/// A missing session is not an error: stores return `Option` and the
/// manager hands back an empty state.
#[derive(Error, Debug)]
pub enum ThreadkeepError {
    /// A write carried a sequence number that is not above the stored one.
    #[error("Stale write for session '{session_key}': sequence {attempted} <= current {current}")]
    StaleWrite {
        /// The session the write was aimed at.
        session_key: String,
        /// The sequence number of the rejected write.
        attempted: u64,
        /// The sequence number already held by the store.
        current: u64,
    },

    /// The backend could not be reached or did not answer in time.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A commit failed at the given step.
    #[error("Commit failed at {step}: {source}")]
    CommitFailed {
        /// The step that failed.
        step: CommitStep,
        /// The underlying store error.
        source: Box<ThreadkeepError>,
    },

    /// The backend answered with an error that is not a transport failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A session key or principal failed validation.
    #[error("Invalid session key: {0}")]
    InvalidSessionKey(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The turn processor failed or was given unusable input.
    #[error("Processor error: {0}")]
    Processor(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThreadkeepError {
    /// Wraps a store error into [`ThreadkeepError::CommitFailed`].
    pub fn commit_failed(step: CommitStep, source: ThreadkeepError) -> Self {
        ThreadkeepError::CommitFailed {
            step,
            source: Box::new(source),
        }
    }

    /// Returns `true` for a sequence regression, including one wrapped in a
    /// failed commit.
    pub fn is_stale_write(&self) -> bool {
        match self {
            ThreadkeepError::StaleWrite { .. } => true,
            ThreadkeepError::CommitFailed { source, .. } => source.is_stale_write(),
            _ => false,
        }
    }

    /// Returns `true` for transport failures, including one wrapped in a
    /// failed commit.
    pub fn is_unavailable(&self) -> bool {
        match self {
            ThreadkeepError::BackendUnavailable(_) => true,
            ThreadkeepError::CommitFailed { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }

    /// Returns `true` when a failed commit left its pending write behind, so
    /// the next load replays the turn.
    ///
    /// A stale checkpoint means another writer won the sequence; the pending
    /// write is then ignored by replay and the turn is lost.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ThreadkeepError::CommitFailed {
                step: CommitStep::Checkpoint,
                source,
            } => !source.is_stale_write(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stale() -> ThreadkeepError {
        ThreadkeepError::StaleWrite {
            session_key: "s".into(),
            attempted: 1,
            current: 1,
        }
    }

    #[test]
    fn commit_failed_display_names_step() {
        let err = ThreadkeepError::commit_failed(CommitStep::PendingWrite, stale());
        let text = err.to_string();
        assert!(text.starts_with("Commit failed at pending write"));
        assert!(text.contains("sequence 1 <= current 1"));
    }

    #[test]
    fn classification_sees_through_commit_failed() {
        let err = ThreadkeepError::commit_failed(CommitStep::Checkpoint, stale());
        assert!(err.is_stale_write());
        assert!(!err.is_unavailable());
        assert!(!err.is_recoverable());

        let err = ThreadkeepError::commit_failed(
            CommitStep::Checkpoint,
            ThreadkeepError::BackendUnavailable("down".into()),
        );
        assert!(err.is_unavailable());
        assert!(err.is_recoverable());

        let err = ThreadkeepError::commit_failed(
            CommitStep::PendingWrite,
            ThreadkeepError::BackendUnavailable("down".into()),
        );
        assert!(!err.is_recoverable());
    }
}
