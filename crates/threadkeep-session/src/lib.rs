//! Session orchestration on top of a checkpoint store.
//!
//! # Main types
//!
//! - [`CheckpointManager`]: Loads, commits and deletes session state.
//! - [`SessionLocks`]: One async mutex per session key.
//! - [`TurnProcessor`]: The component that turns a state into replies.
//! - [`Conversation`]: Glue running one user turn end to end.

/// Checkpoint manager.
pub mod manager;
/// Per-session locking.
pub mod lock;
/// Turn processing glue.
pub mod turn;

pub use lock::{SessionGuard, SessionLocks};
pub use manager::CheckpointManager;
pub use turn::{Conversation, EchoProcessor, TurnProcessor};
