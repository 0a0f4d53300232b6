use crate::manager::CheckpointManager;
use async_trait::async_trait;
use std::sync::Arc;
use threadkeep_core::{Message, Role, SessionKey, SessionState, ThreadkeepError, ThreadkeepResult};
use tracing::debug;

/// Produces the replies for one turn of a conversation.
///
/// The processor sees the effective state with the user's message already
/// appended. It is called without any session lock held.
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    /// Returns the messages to append after the user's.
    async fn process(&self, state: &SessionState) -> ThreadkeepResult<Vec<Message>>;
}

/// Replies with the last user message. Stands in for a model in demos and
/// tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

#[async_trait]
impl TurnProcessor for EchoProcessor {
    async fn process(&self, state: &SessionState) -> ThreadkeepResult<Vec<Message>> {
        let last = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| ThreadkeepError::Processor("no user message to answer".to_string()))?;
        Ok(vec![Message::assistant(format!("You said: {}", last.content))])
    }
}

/// Runs user turns against a [`TurnProcessor`] and persists them.
pub struct Conversation {
    manager: Arc<CheckpointManager>,
    processor: Arc<dyn TurnProcessor>,
}

impl Conversation {
    /// Pairs a manager with the processor answering its turns.
    pub fn new(manager: Arc<CheckpointManager>, processor: Arc<dyn TurnProcessor>) -> Self {
        Self { manager, processor }
    }

    /// The underlying checkpoint manager.
    pub fn manager(&self) -> &Arc<CheckpointManager> {
        &self.manager
    }

    /// Handles one user message and returns the replies.
    ///
    /// The user message and the replies are committed together on top of
    /// the state the processor saw; if the processor fails nothing is
    /// written. If another turn landed on the session in the meantime the
    /// commit fails with a stale sequence and the replies are discarded.
    pub async fn run_turn(
        &self,
        session_key: &SessionKey,
        user_input: &str,
    ) -> ThreadkeepResult<Vec<Message>> {
        if user_input.trim().is_empty() {
            return Err(ThreadkeepError::Processor("empty user input".to_string()));
        }

        let observed = self.manager.load(session_key).await?;
        let user = Message::user(user_input);
        let mut working = observed.clone();
        working.extend_messages([user.clone()]);

        let replies = self.processor.process(&working).await?;
        debug!(session_key = %session_key, replies = replies.len(), "Turn processed");

        let mut turn = Vec::with_capacity(replies.len() + 1);
        turn.push(user);
        turn.extend(replies.iter().cloned());
        self.manager.commit_from(&observed, turn).await?;
        Ok(replies)
    }

    /// The committed message history of a session.
    pub async fn history(&self, session_key: &SessionKey) -> ThreadkeepResult<Vec<Message>> {
        Ok(self.manager.load(session_key).await?.messages)
    }

    /// Drops the session entirely.
    pub async fn forget(&self, session_key: &SessionKey) -> ThreadkeepResult<()> {
        self.manager.delete(session_key).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_answers_last_user_message() {
        let mut state = SessionState::empty(SessionKey::generate());
        state.extend_messages([
            Message::user("first"),
            Message::assistant("You said: first"),
            Message::user("second"),
        ]);
        let replies = EchoProcessor.process(&state).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].role, Role::Assistant);
        assert_eq!(replies[0].content, "You said: second");
    }

    #[tokio::test]
    async fn echo_needs_a_user_message() {
        let state = SessionState::empty(SessionKey::generate());
        let err = EchoProcessor.process(&state).await.unwrap_err();
        assert!(matches!(err, ThreadkeepError::Processor(_)));
    }
}
