use async_trait::async_trait;
use threadkeep_core::{Checkpoint, PendingWrite, SessionKey, ThreadkeepResult};

/// Uniform save/load contract shared by every checkpoint backend.
///
/// All methods are keyed by [`SessionKey`]; operations on different keys are
/// independent. Implementations must reject sequence regressions themselves
/// instead of relying on callers to serialise writes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Short name used in logs.
    fn backend_name(&self) -> &'static str;

    /// Persists `checkpoint` as the latest for `session_key`.
    ///
    /// Fails with [`StaleWrite`](threadkeep_core::ThreadkeepError::StaleWrite)
    /// and leaves the store unchanged if `checkpoint.sequence_no` is not
    /// strictly above the stored sequence.
    async fn put_checkpoint(
        &self,
        session_key: &SessionKey,
        checkpoint: &Checkpoint,
    ) -> ThreadkeepResult<()>;

    /// The highest-sequence checkpoint, or `None` if the session does not
    /// exist (never created, deleted, or expired).
    async fn get_latest_checkpoint(
        &self,
        session_key: &SessionKey,
    ) -> ThreadkeepResult<Option<Checkpoint>>;

    /// Appends to the session's pending-write log.
    ///
    /// Rejects with `StaleWrite` a write whose sequence is not above the
    /// latest checkpoint, or a second write for the same sequence and
    /// channel.
    async fn put_pending_write(
        &self,
        session_key: &SessionKey,
        write: &PendingWrite,
    ) -> ThreadkeepResult<()>;

    /// Pending writes with `sequence_no > since_sequence`, ordered by
    /// sequence then channel.
    async fn get_pending_writes(
        &self,
        session_key: &SessionKey,
        since_sequence: u64,
    ) -> ThreadkeepResult<Vec<PendingWrite>>;

    /// Removes pending writes with `sequence_no <= up_to_sequence`.
    /// Returns how many were removed.
    async fn prune_pending_writes(
        &self,
        session_key: &SessionKey,
        up_to_sequence: u64,
    ) -> ThreadkeepResult<usize>;

    /// Removes every record of the session. Deleting a missing session is
    /// not an error.
    async fn delete_session(&self, session_key: &SessionKey) -> ThreadkeepResult<()>;
}

/// Sort order of [`CheckpointStore::get_pending_writes`].
pub(crate) fn sort_pending(writes: &mut [PendingWrite]) {
    writes.sort_by(|a, b| {
        a.sequence_no
            .cmp(&b.sequence_no)
            .then_with(|| a.channel.cmp(&b.channel))
    });
}
