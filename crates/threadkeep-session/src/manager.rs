use crate::lock::SessionLocks;
use std::sync::Arc;
use threadkeep_core::{
    CommitStep, Message, PendingWrite, Replay, SessionKey, SessionState, ThreadkeepError,
    ThreadkeepResult,
};
use threadkeep_store::CheckpointStore;
use tracing::{debug, info, warn};

/// Loads and commits conversation state through a [`CheckpointStore`].
///
/// Every commit is written twice: first as a pending write at the next
/// sequence, then as a consolidated checkpoint. A writer that dies between
/// the two leaves the pending write behind, and the next [`load`] replays it.
///
/// [`load`]: CheckpointManager::load
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    locks: SessionLocks,
}

impl CheckpointManager {
    /// Creates a manager over `store`.
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            locks: SessionLocks::new(),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Returns the effective state of a session: its latest checkpoint plus
    /// every pending write above it. An unknown session yields the empty
    /// state at sequence 0.
    ///
    /// When replay moves the state past its checkpoint, the commit metadata
    /// is stamped again so the result equals what the interrupted commit
    /// would have written.
    pub async fn load(&self, session_key: &SessionKey) -> ThreadkeepResult<SessionState> {
        let mut state = match self.store.get_latest_checkpoint(session_key).await? {
            Some(checkpoint) => SessionState::from(checkpoint),
            None => SessionState::empty(session_key.clone()),
        };
        let checkpoint_seq = state.sequence_no;

        let writes = self
            .store
            .get_pending_writes(session_key, checkpoint_seq)
            .await?;
        for write in &writes {
            match state.apply(write) {
                Ok(Replay::Applied) => {}
                Ok(Replay::UnknownChannel) => {
                    warn!(
                        session_key = %session_key,
                        sequence_no = write.sequence_no,
                        channel = %write.channel,
                        "Skipping pending write on unknown channel"
                    );
                }
                Err(e) => {
                    warn!(
                        session_key = %session_key,
                        sequence_no = write.sequence_no,
                        channel = %write.channel,
                        error = %e,
                        "Skipping malformed pending write"
                    );
                    state.sequence_no = state.sequence_no.max(write.sequence_no);
                }
            }
        }

        if state.sequence_no > checkpoint_seq {
            state.stamp_commit();
        }
        if !writes.is_empty() {
            info!(
                session_key = %session_key,
                from = checkpoint_seq,
                to = state.sequence_no,
                replayed = writes.len(),
                "Replayed pending writes"
            );
        }
        debug!(
            session_key = %session_key,
            sequence_no = state.sequence_no,
            messages = state.messages.len(),
            backend = self.store.backend_name(),
            "Loaded session"
        );
        Ok(state)
    }

    /// Appends `new_messages` to the session under its lock.
    ///
    /// Concurrent commits on one key queue up and each lands on its own
    /// sequence. A failure to read the current state is reported as
    /// [`CommitStep::Load`].
    pub async fn commit(
        &self,
        session_key: &SessionKey,
        new_messages: Vec<Message>,
    ) -> ThreadkeepResult<SessionState> {
        let _guard = self.locks.acquire(session_key).await;
        let observed = self
            .load(session_key)
            .await
            .map_err(|e| ThreadkeepError::commit_failed(CommitStep::Load, e))?;
        self.commit_from(&observed, new_messages).await
    }

    /// Appends `new_messages` on top of a state the caller already holds,
    /// without taking the session lock.
    ///
    /// If another writer moved the session past `observed`, the store
    /// rejects the write and the error reports a stale sequence.
    pub async fn commit_from(
        &self,
        observed: &SessionState,
        new_messages: Vec<Message>,
    ) -> ThreadkeepResult<SessionState> {
        let session_key = &observed.session_key;
        let sequence_no = observed.next_sequence();

        let write = PendingWrite::messages(session_key.clone(), sequence_no, &new_messages)
            .map_err(|e| ThreadkeepError::commit_failed(CommitStep::PendingWrite, e))?;
        if let Err(e) = self.store.put_pending_write(session_key, &write).await {
            warn!(
                session_key = %session_key,
                sequence_no,
                error = %e,
                "Pending write failed"
            );
            return Err(ThreadkeepError::commit_failed(CommitStep::PendingWrite, e));
        }

        let mut next = observed.clone();
        next.extend_messages(new_messages);
        next.sequence_no = sequence_no;
        next.stamp_commit();

        if let Err(e) = self
            .store
            .put_checkpoint(session_key, &next.to_checkpoint())
            .await
        {
            warn!(
                session_key = %session_key,
                sequence_no,
                error = %e,
                "Checkpoint failed after pending write"
            );
            return Err(ThreadkeepError::commit_failed(CommitStep::Checkpoint, e));
        }

        match self
            .store
            .prune_pending_writes(session_key, sequence_no)
            .await
        {
            Ok(removed) => {
                debug!(session_key = %session_key, sequence_no, removed, "Pruned pending writes");
            }
            Err(e) => {
                warn!(
                    session_key = %session_key,
                    sequence_no,
                    error = %e,
                    "Pruning pending writes failed"
                );
            }
        }

        info!(
            session_key = %session_key,
            sequence_no,
            messages = next.messages.len(),
            "Committed turn"
        );
        Ok(next)
    }

    /// Removes every record of the session. Deleting an unknown session is a
    /// no-op.
    pub async fn delete(&self, session_key: &SessionKey) -> ThreadkeepResult<()> {
        let _guard = self.locks.acquire(session_key).await;
        self.store.delete_session(session_key).await?;
        info!(session_key = %session_key, "Deleted session");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use threadkeep_store::MemoryStore;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn unknown_session_loads_empty() {
        let state = manager().load(&SessionKey::generate()).await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.sequence_no, 0);
    }

    #[tokio::test]
    async fn commit_records_metadata() {
        let manager = manager();
        let key = SessionKey::generate();
        let state = manager
            .commit(&key, vec![Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        assert_eq!(state.sequence_no, 1);
        assert_eq!(state.metadata["message_count"], json!(2));
        assert_eq!(state.metadata["step"], json!(1));
        assert_eq!(state.metadata["source"], json!("loop"));

        let checkpoint = manager
            .store()
            .get_latest_checkpoint(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.metadata, state.metadata);
    }

    #[tokio::test]
    async fn commit_prunes_its_pending_write() {
        let manager = manager();
        let key = SessionKey::generate();
        manager.commit(&key, vec![Message::user("a")]).await.unwrap();
        manager.commit(&key, vec![Message::user("b")]).await.unwrap();
        let left = manager.store().get_pending_writes(&key, 0).await.unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_is_skipped_but_advances() {
        let manager = manager();
        let key = SessionKey::generate();
        manager.commit(&key, vec![Message::user("a")]).await.unwrap();

        let odd = PendingWrite::new(key.clone(), 2, "tool_calls", json!({"name": "search"}));
        manager.store().put_pending_write(&key, &odd).await.unwrap();

        let state = manager.load(&key).await.unwrap();
        assert_eq!(state.sequence_no, 2);
        assert_eq!(state.messages.len(), 1);

        let next = manager.commit(&key, vec![Message::user("b")]).await.unwrap();
        assert_eq!(next.sequence_no, 3);
    }

    #[tokio::test]
    async fn malformed_write_is_skipped() {
        let manager = manager();
        let key = SessionKey::generate();
        let bad = PendingWrite::new(key.clone(), 1, "messages", json!("not a list"));
        manager.store().put_pending_write(&key, &bad).await.unwrap();
        let good = PendingWrite::messages(key.clone(), 2, &[Message::user("ok")]).unwrap();
        manager.store().put_pending_write(&key, &good).await.unwrap();

        let state = manager.load(&key).await.unwrap();
        assert_eq!(state.sequence_no, 2);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].content, "ok");
    }

    #[tokio::test]
    async fn metadata_channel_merges() {
        let manager = manager();
        let key = SessionKey::generate();
        let patch = PendingWrite::new(key.clone(), 1, "metadata", json!({"lang": "en"}));
        manager.store().put_pending_write(&key, &patch).await.unwrap();

        let state = manager.load(&key).await.unwrap();
        assert_eq!(state.metadata["lang"], json!("en"));
        assert_eq!(state.sequence_no, 1);
    }
}
