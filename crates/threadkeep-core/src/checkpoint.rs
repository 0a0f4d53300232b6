use crate::error::ThreadkeepResult;
use crate::message::Message;
use crate::session_key::SessionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Channel whose value is a JSON array of messages appended to the history.
pub const MESSAGES_CHANNEL: &str = "messages";
/// Channel whose value is a JSON object merged into the metadata.
pub const METADATA_CHANNEL: &str = "metadata";

const COMMIT_SOURCE: &str = "loop";

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The conversation this snapshot belongs to.
    pub session_key: SessionKey,
    /// Strictly increasing per session, starting at 1.
    pub sequence_no: u64,
    /// Ordered message history.
    pub messages: Vec<Message>,
    /// Free-form metadata recorded by the writer.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// UTC timestamp of when the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PendingWrite
// ---------------------------------------------------------------------------

/// A delta recorded before the checkpoint that consolidates it.
///
/// If the writer dies after the pending write lands but before the
/// checkpoint does, replaying the pending write on the last checkpoint
/// reconstructs the lost state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    /// The conversation this delta belongs to.
    pub session_key: SessionKey,
    /// The checkpoint sequence this delta will be folded into.
    pub sequence_no: u64,
    /// Which part of the state the value updates.
    pub channel: String,
    /// The delta itself.
    pub value: serde_json::Value,
    /// UTC timestamp of when the delta was recorded.
    pub written_at: DateTime<Utc>,
}

impl PendingWrite {
    /// A delta on an arbitrary channel.
    pub fn new(
        session_key: SessionKey,
        sequence_no: u64,
        channel: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            session_key,
            sequence_no,
            channel: channel.into(),
            value,
            written_at: Utc::now(),
        }
    }

    /// A delta appending `messages` to the history.
    pub fn messages(
        session_key: SessionKey,
        sequence_no: u64,
        messages: &[Message],
    ) -> ThreadkeepResult<Self> {
        let value = serde_json::to_value(messages)?;
        Ok(Self::new(session_key, sequence_no, MESSAGES_CHANNEL, value))
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Outcome of applying one pending write to a [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The write was folded into the state.
    Applied,
    /// The write targets a channel this version does not know.
    UnknownChannel,
}

/// The effective state of a conversation: the latest checkpoint plus any
/// replayed pending writes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// The conversation.
    pub session_key: SessionKey,
    /// Sequence of the last checkpoint or replayed write; 0 when empty.
    pub sequence_no: u64,
    /// Ordered message history.
    pub messages: Vec<Message>,
    /// Merged metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionState {
    /// The state of a session that has never been committed.
    pub fn empty(session_key: SessionKey) -> Self {
        Self {
            session_key,
            sequence_no: 0,
            messages: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Returns `true` when nothing has been committed for this session.
    pub fn is_empty(&self) -> bool {
        self.sequence_no == 0 && self.messages.is_empty()
    }

    /// The sequence the next commit will use.
    pub fn next_sequence(&self) -> u64 {
        self.sequence_no + 1
    }

    /// Appends messages without touching the sequence.
    pub fn extend_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Folds a pending write into the state and advances the sequence to
    /// the write's sequence.
    ///
    /// A write on an unknown channel still advances the sequence so a later
    /// commit never reuses it.
    pub fn apply(&mut self, write: &PendingWrite) -> ThreadkeepResult<Replay> {
        let outcome = match write.channel.as_str() {
            MESSAGES_CHANNEL => {
                let messages: Vec<Message> = serde_json::from_value(write.value.clone())?;
                self.messages.extend(messages);
                Replay::Applied
            }
            METADATA_CHANNEL => {
                let patch: HashMap<String, serde_json::Value> =
                    serde_json::from_value(write.value.clone())?;
                self.metadata.extend(patch);
                Replay::Applied
            }
            _ => Replay::UnknownChannel,
        };
        self.sequence_no = self.sequence_no.max(write.sequence_no);
        Ok(outcome)
    }

    /// Writes the commit bookkeeping into the metadata: `source`,
    /// `message_count` and `step`.
    ///
    /// Every field is derived from the state itself, so a state rebuilt by
    /// replay carries the same values as the checkpoint it stands in for.
    pub fn stamp_commit(&mut self) {
        self.metadata
            .insert("source".to_string(), serde_json::json!(COMMIT_SOURCE));
        self.metadata.insert(
            "message_count".to_string(),
            serde_json::json!(self.messages.len()),
        );
        self.metadata
            .insert("step".to_string(), serde_json::json!(self.sequence_no));
    }

    /// Snapshots the state as a checkpoint at the current sequence.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            session_key: self.session_key.clone(),
            sequence_no: self.sequence_no,
            messages: self.messages.clone(),
            metadata: self.metadata.clone(),
            created_at: Utc::now(),
        }
    }
}

impl From<Checkpoint> for SessionState {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            session_key: checkpoint.session_key,
            sequence_no: checkpoint.sequence_no,
            messages: checkpoint.messages,
            metadata: checkpoint.metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// TtlPolicy
// ---------------------------------------------------------------------------

/// Expiry policy of a TTL-capable backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// How long a session's records live after the last write.
    pub default_ttl: Duration,
    /// Whether reads also reset the expiry (sliding window).
    pub refresh_on_read: bool,
}

impl TtlPolicy {
    /// A fixed-window policy.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            refresh_on_read: false,
        }
    }

    /// A sliding-window policy: reads reset the expiry.
    pub fn sliding(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            refresh_on_read: true,
        }
    }

    /// The TTL in whole milliseconds, at least 1.
    pub fn ttl_millis(&self) -> u64 {
        u64::try_from(self.default_ttl.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }
}
