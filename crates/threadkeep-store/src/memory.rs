use crate::store::{sort_pending, CheckpointStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use threadkeep_core::{Checkpoint, PendingWrite, SessionKey, ThreadkeepError, ThreadkeepResult};
use tokio::sync::RwLock;

#[derive(Default)]
struct SessionRecords {
    checkpoint: Option<Checkpoint>,
    writes: BTreeMap<(u64, String), PendingWrite>,
}

impl SessionRecords {
    fn current_sequence(&self) -> u64 {
        self.checkpoint.as_ref().map_or(0, |c| c.sequence_no)
    }
}

/// In-process checkpoint store for local development and tests.
///
/// Only the latest checkpoint per session is kept. Records never expire and
/// vanish with the process.
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionKey, SessionRecords>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of sessions holding at least one record.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put_checkpoint(
        &self,
        session_key: &SessionKey,
        checkpoint: &Checkpoint,
    ) -> ThreadkeepResult<()> {
        let mut sessions = self.sessions.write().await;
        let records = sessions.entry(session_key.clone()).or_default();
        let current = records.current_sequence();
        if records.checkpoint.is_some() && checkpoint.sequence_no <= current {
            return Err(ThreadkeepError::StaleWrite {
                session_key: session_key.to_string(),
                attempted: checkpoint.sequence_no,
                current,
            });
        }
        records.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn get_latest_checkpoint(
        &self,
        session_key: &SessionKey,
    ) -> ThreadkeepResult<Option<Checkpoint>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_key)
            .and_then(|records| records.checkpoint.clone()))
    }

    async fn put_pending_write(
        &self,
        session_key: &SessionKey,
        write: &PendingWrite,
    ) -> ThreadkeepResult<()> {
        let mut sessions = self.sessions.write().await;
        let records = sessions.entry(session_key.clone()).or_default();
        let current = records.current_sequence();
        if records.checkpoint.is_some() && write.sequence_no <= current {
            return Err(ThreadkeepError::StaleWrite {
                session_key: session_key.to_string(),
                attempted: write.sequence_no,
                current,
            });
        }
        let slot = (write.sequence_no, write.channel.clone());
        if records.writes.contains_key(&slot) {
            return Err(ThreadkeepError::StaleWrite {
                session_key: session_key.to_string(),
                attempted: write.sequence_no,
                current: write.sequence_no,
            });
        }
        records.writes.insert(slot, write.clone());
        Ok(())
    }

    async fn get_pending_writes(
        &self,
        session_key: &SessionKey,
        since_sequence: u64,
    ) -> ThreadkeepResult<Vec<PendingWrite>> {
        let sessions = self.sessions.read().await;
        let mut writes: Vec<PendingWrite> = sessions
            .get(session_key)
            .map(|records| {
                records
                    .writes
                    .values()
                    .filter(|w| w.sequence_no > since_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_pending(&mut writes);
        Ok(writes)
    }

    async fn prune_pending_writes(
        &self,
        session_key: &SessionKey,
        up_to_sequence: u64,
    ) -> ThreadkeepResult<usize> {
        let mut sessions = self.sessions.write().await;
        let Some(records) = sessions.get_mut(session_key) else {
            return Ok(0);
        };
        let before = records.writes.len();
        records.writes.retain(|(seq, _), _| *seq > up_to_sequence);
        Ok(before - records.writes.len())
    }

    async fn delete_session(&self, session_key: &SessionKey) -> ThreadkeepResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use threadkeep_core::{Message, SessionState};

    fn checkpoint(key: &SessionKey, seq: u64, text: &str) -> Checkpoint {
        let mut state = SessionState::empty(key.clone());
        state.extend_messages([Message::user(text)]);
        state.sequence_no = seq;
        state.to_checkpoint()
    }

    #[tokio::test]
    async fn stale_checkpoint_leaves_store_unchanged() {
        let store = MemoryStore::new();
        let key = SessionKey::generate();
        store.put_checkpoint(&key, &checkpoint(&key, 2, "two")).await.unwrap();

        let err = store
            .put_checkpoint(&key, &checkpoint(&key, 2, "again"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ThreadkeepError::StaleWrite { attempted: 2, current: 2, .. }
        ));
        assert!(store
            .put_checkpoint(&key, &checkpoint(&key, 1, "older"))
            .await
            .unwrap_err()
            .is_stale_write());

        let latest = store.get_latest_checkpoint(&key).await.unwrap().unwrap();
        assert_eq!(latest.sequence_no, 2);
        assert_eq!(latest.messages[0].content, "two");
    }

    #[tokio::test]
    async fn duplicate_pending_write_is_rejected() {
        let store = MemoryStore::new();
        let key = SessionKey::generate();
        let write = PendingWrite::messages(key.clone(), 1, &[Message::user("a")]).unwrap();
        store.put_pending_write(&key, &write).await.unwrap();
        assert!(store
            .put_pending_write(&key, &write)
            .await
            .unwrap_err()
            .is_stale_write());
        assert_eq!(store.get_pending_writes(&key, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_on_missing_session_is_zero() {
        let store = MemoryStore::new();
        let removed = store
            .prune_pending_writes(&SessionKey::generate(), 10)
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn delete_drops_every_record() {
        let store = MemoryStore::new();
        let key = SessionKey::generate();
        store.put_checkpoint(&key, &checkpoint(&key, 1, "x")).await.unwrap();
        let write = PendingWrite::messages(key.clone(), 2, &[Message::user("y")]).unwrap();
        store.put_pending_write(&key, &write).await.unwrap();

        store.delete_session(&key).await.unwrap();
        assert!(store.get_latest_checkpoint(&key).await.unwrap().is_none());
        assert!(store.get_pending_writes(&key, 0).await.unwrap().is_empty());
        assert_eq!(store.session_count().await, 0);
    }
}
