//! Checkpoint storage backends.
//!
//! Every backend implements [`CheckpointStore`], so the checkpoint manager
//! never knows which one it talks to; switching backends is a
//! configuration change ([`StoreConfig`]).
//!
//! | Backend         | Durability      | Expiry                                   |
//! |-----------------|-----------------|------------------------------------------|
//! | [`MemoryStore`] | process lifetime | never                                   |
//! | [`RedisStore`]  | Redis server    | point-in-time (key expiry), optional sliding window |
//! | [`MongoStore`]  | MongoDB server  | eventual (TTL index reaper)              |

/// Backend selection and connection.
pub mod config;
/// In-process backend.
pub mod memory;
/// MongoDB backend.
pub mod mongo_store;
/// Redis backend.
pub mod redis_store;
/// The storage contract.
pub mod store;

pub use config::{MongoConfig, RedisConfig, StoreConfig};
pub use memory::MemoryStore;
pub use mongo_store::MongoStore;
pub use redis_store::RedisStore;
pub use store::CheckpointStore;
