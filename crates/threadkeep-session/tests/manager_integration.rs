#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use threadkeep_core::{
    Checkpoint, CommitStep, Message, PendingWrite, SessionKey, SessionState, ThreadkeepError,
    ThreadkeepResult,
};
use threadkeep_session::{CheckpointManager, Conversation, EchoProcessor, TurnProcessor};
use threadkeep_store::{CheckpointStore, MemoryStore};

/// Wraps a memory store and fails chosen operations on demand.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_read: AtomicBool,
    fail_pending_write: AtomicBool,
    fail_checkpoint: AtomicBool,
    fail_prune: AtomicBool,
}

fn outage(op: &str) -> ThreadkeepError {
    ThreadkeepError::BackendUnavailable(format!("{op}: connection reset"))
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn put_checkpoint(&self, key: &SessionKey, cp: &Checkpoint) -> ThreadkeepResult<()> {
        if self.fail_checkpoint.load(Ordering::SeqCst) {
            return Err(outage("put_checkpoint"));
        }
        self.inner.put_checkpoint(key, cp).await
    }

    async fn get_latest_checkpoint(&self, key: &SessionKey) -> ThreadkeepResult<Option<Checkpoint>> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(outage("get_latest_checkpoint"));
        }
        self.inner.get_latest_checkpoint(key).await
    }

    async fn put_pending_write(&self, key: &SessionKey, w: &PendingWrite) -> ThreadkeepResult<()> {
        if self.fail_pending_write.load(Ordering::SeqCst) {
            return Err(outage("put_pending_write"));
        }
        self.inner.put_pending_write(key, w).await
    }

    async fn get_pending_writes(
        &self,
        key: &SessionKey,
        since: u64,
    ) -> ThreadkeepResult<Vec<PendingWrite>> {
        self.inner.get_pending_writes(key, since).await
    }

    async fn prune_pending_writes(&self, key: &SessionKey, up_to: u64) -> ThreadkeepResult<usize> {
        if self.fail_prune.load(Ordering::SeqCst) {
            return Err(outage("prune_pending_writes"));
        }
        self.inner.prune_pending_writes(key, up_to).await
    }

    async fn delete_session(&self, key: &SessionKey) -> ThreadkeepResult<()> {
        self.inner.delete_session(key).await
    }
}

fn flaky() -> (Arc<FlakyStore>, CheckpointManager) {
    let store = Arc::new(FlakyStore::default());
    let manager = CheckpointManager::new(store.clone());
    (store, manager)
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

#[tokio::test]
async fn test_load_without_commits_is_empty() {
    let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
    let key = SessionKey::generate();
    let state = manager.load(&key).await.unwrap();
    assert_eq!(state.session_key, key);
    assert_eq!(state.sequence_no, 0);
    assert!(state.messages.is_empty());
}

#[tokio::test]
async fn test_load_after_commit_adds_messages() {
    let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
    let key = SessionKey::for_principal("alice").unwrap();

    manager
        .commit(&key, vec![Message::user("hi"), Message::assistant("hello")])
        .await
        .unwrap();
    let before = manager.load(&key).await.unwrap();

    let committed = manager
        .commit(&key, vec![Message::user("again")])
        .await
        .unwrap();
    let after = manager.load(&key).await.unwrap();

    assert_eq!(after, committed);
    assert_eq!(after.sequence_no, before.sequence_no + 1);
    assert_eq!(contents(&after.messages), vec!["hi", "hello", "again"]);
    assert_eq!(after.messages[..2], before.messages[..]);
}

#[tokio::test]
async fn test_crash_before_checkpoint_is_recovered_by_replay() {
    let (store, manager) = flaky();
    let key = SessionKey::generate();
    manager.commit(&key, vec![Message::user("one")]).await.unwrap();
    let before = manager.load(&key).await.unwrap();
    let turn = vec![Message::user("two"), Message::assistant("You said: two")];

    // What the commit returns when nothing goes wrong.
    let healthy = CheckpointManager::new(Arc::new(MemoryStore::new()));
    healthy
        .store()
        .put_checkpoint(&key, &before.to_checkpoint())
        .await
        .unwrap();
    let expected = healthy.commit_from(&before, turn.clone()).await.unwrap();

    store.fail_checkpoint.store(true, Ordering::SeqCst);
    let err = manager.commit(&key, turn).await.unwrap_err();
    assert!(matches!(
        err,
        ThreadkeepError::CommitFailed {
            step: CommitStep::Checkpoint,
            ..
        }
    ));
    assert!(err.is_recoverable());
    assert!(err.is_unavailable());

    // The previous checkpoint is intact.
    let latest = store.get_latest_checkpoint(&key).await.unwrap().unwrap();
    assert_eq!(latest.sequence_no, 1);

    let replayed = manager.load(&key).await.unwrap();
    assert_eq!(replayed.sequence_no, 2);
    assert_eq!(contents(&replayed.messages), vec!["one", "two", "You said: two"]);
    assert_eq!(replayed, expected);
    assert_eq!(replayed.metadata["message_count"], serde_json::json!(3));
    assert_eq!(replayed.metadata["step"], serde_json::json!(2));

    // The next commit builds on the replayed state.
    store.fail_checkpoint.store(false, Ordering::SeqCst);
    let next = manager.commit(&key, vec![Message::user("three")]).await.unwrap();
    assert_eq!(next.sequence_no, 3);
    assert_eq!(next.messages.len(), 4);
    assert!(store.get_pending_writes(&key, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_write_failure_changes_nothing() {
    let (store, manager) = flaky();
    let key = SessionKey::generate();
    manager.commit(&key, vec![Message::user("one")]).await.unwrap();
    let before = manager.load(&key).await.unwrap();

    store.fail_pending_write.store(true, Ordering::SeqCst);
    let err = manager
        .commit(&key, vec![Message::user("lost")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ThreadkeepError::CommitFailed {
            step: CommitStep::PendingWrite,
            ..
        }
    ));
    assert!(!err.is_recoverable());

    assert_eq!(manager.load(&key).await.unwrap(), before);
}

#[tokio::test]
async fn test_read_failure_during_commit_is_a_load_step_failure() {
    let (store, manager) = flaky();
    let key = SessionKey::generate();
    manager.commit(&key, vec![Message::user("one")]).await.unwrap();

    store.fail_read.store(true, Ordering::SeqCst);
    let err = manager
        .commit(&key, vec![Message::user("two")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ThreadkeepError::CommitFailed {
            step: CommitStep::Load,
            ..
        }
    ));
    assert!(err.is_unavailable());
    assert!(!err.is_recoverable());

    store.fail_read.store(false, Ordering::SeqCst);
    assert!(store.get_pending_writes(&key, 1).await.unwrap().is_empty());
    assert_eq!(manager.load(&key).await.unwrap().sequence_no, 1);
}

#[tokio::test]
async fn test_prune_failure_is_swallowed() {
    let (store, manager) = flaky();
    let key = SessionKey::generate();
    store.fail_prune.store(true, Ordering::SeqCst);

    let state = manager.commit(&key, vec![Message::user("one")]).await.unwrap();
    assert_eq!(state.sequence_no, 1);

    // The leftover write sits at the checkpoint's sequence and is not replayed.
    assert_eq!(store.get_pending_writes(&key, 0).await.unwrap().len(), 1);
    let loaded = manager.load(&key).await.unwrap();
    assert_eq!(contents(&loaded.messages), vec!["one"]);
}

#[tokio::test]
async fn test_concurrent_commit_from_admits_one_winner() {
    let manager = Arc::new(CheckpointManager::new(Arc::new(MemoryStore::new())));
    let key = SessionKey::generate();
    manager.commit(&key, vec![Message::user("base")]).await.unwrap();
    let observed = manager.load(&key).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..2 {
        let manager = manager.clone();
        let observed = observed.clone();
        handles.push(tokio::spawn(async move {
            manager
                .commit_from(&observed, vec![Message::user(format!("writer {i}"))])
                .await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(state) => winners.push(state),
            Err(e) => {
                assert!(e.is_stale_write(), "{e}");
                assert!(matches!(e, ThreadkeepError::CommitFailed { .. }));
            }
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].sequence_no, 2);

    let latest = manager.load(&key).await.unwrap();
    assert_eq!(latest.sequence_no, 2);
    assert_eq!(latest.messages.len(), 2);
}

#[tokio::test]
async fn test_concurrent_commit_is_serialised() {
    let manager = Arc::new(CheckpointManager::new(Arc::new(MemoryStore::new())));
    let key = SessionKey::generate();

    let mut handles = Vec::new();
    for i in 0..2 {
        let manager = manager.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            manager
                .commit(&key, vec![Message::user(format!("writer {i}"))])
                .await
        }));
    }

    let mut sequences = Vec::new();
    for handle in handles {
        sequences.push(handle.await.unwrap().unwrap().sequence_no);
    }
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(manager.load(&key).await.unwrap().messages.len(), 2);
}

#[tokio::test]
async fn test_delete_then_load_is_empty() {
    let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
    let key = SessionKey::generate();
    manager.commit(&key, vec![Message::user("one")]).await.unwrap();

    manager.delete(&key).await.unwrap();
    manager.delete(&key).await.unwrap();
    assert!(manager.load(&key).await.unwrap().is_empty());

    let fresh = manager.commit(&key, vec![Message::user("again")]).await.unwrap();
    assert_eq!(fresh.sequence_no, 1);
}

#[tokio::test]
async fn test_conversation_runs_echo_turns() {
    let manager = Arc::new(CheckpointManager::new(Arc::new(MemoryStore::new())));
    let conversation = Conversation::new(manager, Arc::new(EchoProcessor));
    let key = SessionKey::for_principal("bob").unwrap();

    let replies = conversation.run_turn(&key, "hello").await.unwrap();
    assert_eq!(contents(&replies), vec!["You said: hello"]);
    conversation.run_turn(&key, "how are you").await.unwrap();

    let history = conversation.history(&key).await.unwrap();
    assert_eq!(
        contents(&history),
        vec!["hello", "You said: hello", "how are you", "You said: how are you"]
    );
    let state = conversation.manager().load(&key).await.unwrap();
    assert_eq!(state.sequence_no, 2);

    conversation.forget(&key).await.unwrap();
    assert!(conversation.history(&key).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conversation_rejects_empty_input() {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(CheckpointManager::new(store.clone()));
    let conversation = Conversation::new(manager, Arc::new(EchoProcessor));

    let err = conversation
        .run_turn(&SessionKey::generate(), "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, ThreadkeepError::Processor(_)));
    assert_eq!(store.session_count().await, 0);
}

/// Commits another turn to the same session while it is thinking.
struct InterruptedProcessor {
    manager: Arc<CheckpointManager>,
}

#[async_trait]
impl TurnProcessor for InterruptedProcessor {
    async fn process(&self, state: &SessionState) -> ThreadkeepResult<Vec<Message>> {
        self.manager
            .commit(&state.session_key, vec![Message::user("meanwhile")])
            .await?;
        Ok(vec![Message::assistant("late reply")])
    }
}

#[tokio::test]
async fn test_turn_over_a_moved_session_is_stale() {
    let manager = Arc::new(CheckpointManager::new(Arc::new(MemoryStore::new())));
    let processor = InterruptedProcessor {
        manager: manager.clone(),
    };
    let conversation = Conversation::new(manager.clone(), Arc::new(processor));
    let key = SessionKey::generate();

    let err = conversation.run_turn(&key, "hello").await.unwrap_err();
    assert!(err.is_stale_write(), "{err}");

    let history = conversation.history(&key).await.unwrap();
    assert_eq!(contents(&history), vec!["meanwhile"]);
    assert_eq!(manager.load(&key).await.unwrap().sequence_no, 1);
}
