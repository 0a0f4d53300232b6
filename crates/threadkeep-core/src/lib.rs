//! Core types and error definitions for threadkeep.
//!
//! This crate holds the record model shared by the storage backends and the
//! checkpoint manager.
//!
//! # Main types
//!
//! - [`ThreadkeepError`]: Unified error enum for stores, manager and CLI.
//! - [`ThreadkeepResult`]: Convenience alias for `Result<T, ThreadkeepError>`.
//! - [`SessionKey`]: Opaque identifier of one conversation thread.
//! - [`Message`] / [`Role`]: Role-tagged conversation messages.
//! - [`Checkpoint`]: Versioned snapshot of a session's message history.
//! - [`PendingWrite`]: Write-ahead delta folded into the next checkpoint.
//! - [`SessionState`]: Effective state after replaying pending writes.
//! - [`TtlPolicy`]: Expiry policy attached to a TTL-capable backend.

/// Checkpoints, pending writes, effective state and TTL policy.
pub mod checkpoint;
/// Error taxonomy.
pub mod error;
/// Conversation messages.
pub mod message;
/// Session identity.
pub mod session_key;

pub use checkpoint::{
    Checkpoint, PendingWrite, Replay, SessionState, TtlPolicy, MESSAGES_CHANNEL, METADATA_CHANNEL,
};
pub use error::{CommitStep, ThreadkeepError, ThreadkeepResult};
pub use message::{Message, Role};
pub use session_key::SessionKey;
