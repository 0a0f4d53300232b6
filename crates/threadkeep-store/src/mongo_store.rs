use crate::config::MongoConfig;
use crate::store::CheckpointStore;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use threadkeep_core::{
    Checkpoint, PendingWrite, SessionKey, ThreadkeepError, ThreadkeepResult, TtlPolicy,
};
use tracing::{debug, info, warn};

const DUPLICATE_KEY: i32 = 11000;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const TTL_INDEX_NAME: &str = "ttl_last_written_at";
const HEAD_RETRIES: usize = 3;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointDocument {
    session_key: String,
    sequence_no: i64,
    payload: String,
    last_written_at: BsonDateTime,
}

impl CheckpointDocument {
    fn from_checkpoint(checkpoint: &Checkpoint) -> ThreadkeepResult<Self> {
        Ok(Self {
            session_key: checkpoint.session_key.to_string(),
            sequence_no: to_i64(checkpoint.sequence_no)?,
            payload: serde_json::to_string(checkpoint)?,
            last_written_at: BsonDateTime::now(),
        })
    }

    fn into_checkpoint(self) -> ThreadkeepResult<Checkpoint> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingWriteDocument {
    session_key: String,
    sequence_no: i64,
    channel: String,
    payload: String,
    last_written_at: BsonDateTime,
}

impl PendingWriteDocument {
    fn from_write(write: &PendingWrite) -> ThreadkeepResult<Self> {
        Ok(Self {
            session_key: write.session_key.to_string(),
            sequence_no: to_i64(write.sequence_no)?,
            channel: write.channel.clone(),
            payload: serde_json::to_string(write)?,
            last_written_at: BsonDateTime::now(),
        })
    }

    fn into_write(self) -> ThreadkeepResult<PendingWrite> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeadDocument {
    session_key: String,
    sequence_no: i64,
    last_written_at: BsonDateTime,
}

// ---------------------------------------------------------------------------
// MongoStore
// ---------------------------------------------------------------------------

/// MongoDB-backed checkpoint store with TTL.
///
/// Checkpoints and pending writes live in separate collections so pending
/// writes can be pruned without touching checkpoint history. A third
/// collection holds one head document per session with its checkpoint
/// sequence; advancing it is a single conditional update, which is what
/// makes the stale-sequence check atomic.
///
/// Every document carries a `last_written_at` date covered by a TTL index.
/// Each write re-stamps the date on all of the session's documents, so a
/// session's records age together and a checkpoint is never reaped ahead of
/// the pending writes that build on it.
///
/// # Relaxed expiry
///
/// Expiry is eventual. MongoDB's TTL monitor removes expired documents in a
/// background pass (every 60 seconds by default), so a read shortly after a
/// session's nominal expiry may still return its data. Reads never extend
/// the lifetime of a session.
pub struct MongoStore {
    db: Database,
    checkpoints: Collection<CheckpointDocument>,
    writes: Collection<PendingWriteDocument>,
    heads: Collection<HeadDocument>,
    ttl: TtlPolicy,
    op_timeout: Duration,
}

impl MongoStore {
    /// Connects, then creates the unique and TTL indexes if they are missing.
    pub async fn connect(config: &MongoConfig) -> ThreadkeepResult<Self> {
        config.validate()?;
        let op_timeout = config.op_timeout();

        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| ThreadkeepError::Config(format!("Invalid mongodb uri: {e}")))?;
        options.app_name = Some("threadkeep".to_string());
        options.server_selection_timeout = Some(op_timeout);
        options.connect_timeout = Some(op_timeout);
        let client = Client::with_options(options).map_err(|e| map_mongo_error("connect", e))?;

        let db = client.database(&config.database);
        let store = Self {
            checkpoints: db.collection(&config.checkpoint_collection),
            writes: db.collection(&config.writes_collection),
            heads: db.collection(&config.head_collection),
            db,
            ttl: config.ttl_policy(),
            op_timeout,
        };
        store.ensure_indexes().await?;

        info!(
            database = %config.database,
            checkpoints = %config.checkpoint_collection,
            writes = %config.writes_collection,
            ttl_secs = config.default_ttl_secs,
            "Connected to mongodb"
        );
        Ok(store)
    }

    /// The TTL policy applied to every document.
    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl
    }

    async fn ensure_indexes(&self) -> ThreadkeepResult<()> {
        let checkpoint_key = IndexModel::builder()
            .keys(doc! { "session_key": 1, "sequence_no": -1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("session_sequence".to_string())
                    .build(),
            )
            .build();
        self.bounded("create_index", async {
            self.checkpoints.create_index(checkpoint_key).await
        })
        .await?;

        let write_key = IndexModel::builder()
            .keys(doc! { "session_key": 1, "sequence_no": 1, "channel": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("session_sequence_channel".to_string())
                    .build(),
            )
            .build();
        self.bounded("create_index", async {
            self.writes.create_index(write_key).await
        })
        .await?;

        let head_key = IndexModel::builder()
            .keys(doc! { "session_key": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("session".to_string())
                    .build(),
            )
            .build();
        self.bounded("create_index", async {
            self.heads.create_index(head_key).await
        })
        .await?;

        self.ensure_ttl_index(self.checkpoints.name()).await?;
        self.ensure_ttl_index(self.writes.name()).await?;
        self.ensure_ttl_index(self.heads.name()).await
    }

    async fn ensure_ttl_index(&self, collection: &str) -> ThreadkeepResult<()> {
        let model = IndexModel::builder()
            .keys(doc! { "last_written_at": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(self.ttl.default_ttl)
                    .name(TTL_INDEX_NAME.to_string())
                    .build(),
            )
            .build();
        let created = tokio::time::timeout(self.op_timeout, async {
            self.db
                .collection::<mongodb::bson::Document>(collection)
                .create_index(model)
                .await
        })
        .await
        .map_err(|_| timed_out("create_index", self.op_timeout))?;

        match created {
            Ok(_) => Ok(()),
            Err(e) if error_code(&e) == Some(INDEX_OPTIONS_CONFLICT) => {
                // The index exists with another TTL; retune it in place.
                let secs = i64::try_from(self.ttl.default_ttl.as_secs()).unwrap_or(i64::MAX);
                warn!(collection, ttl_secs = secs, "Updating TTL of existing index");
                self.bounded("coll_mod", async {
                    self.db
                        .run_command(doc! {
                            "collMod": collection,
                            "index": { "name": TTL_INDEX_NAME, "expireAfterSeconds": secs },
                        })
                        .await
                })
                .await?;
                Ok(())
            }
            Err(e) => Err(map_mongo_error("create_index", e)),
        }
    }

    async fn latest_document(
        &self,
        session_key: &SessionKey,
    ) -> ThreadkeepResult<Option<CheckpointDocument>> {
        self.bounded("find_latest_checkpoint", async {
            self.checkpoints
                .find_one(doc! { "session_key": session_key.as_str() })
                .sort(doc! { "sequence_no": -1 })
                .await
        })
        .await
    }

    async fn head_sequence(&self, session_key: &SessionKey) -> ThreadkeepResult<Option<u64>> {
        let head = self
            .bounded("find_head", async {
                self.heads
                    .find_one(doc! { "session_key": session_key.as_str() })
                    .await
            })
            .await?;
        Ok(head.map(|h| h.sequence_no.unsigned_abs()))
    }

    /// Moves the session head to `sequence_no` if it is below it.
    ///
    /// The filter only matches a lower head. When it matches nothing the
    /// upsert collides with the existing head on the unique index, which
    /// means the head is already at or above `sequence_no`. A collision can
    /// also come from two first writers racing to create the head; the head
    /// is then re-read and the update retried.
    async fn advance_head(&self, session_key: &SessionKey, sequence_no: u64) -> ThreadkeepResult<()> {
        let target = to_i64(sequence_no)?;
        for _ in 0..HEAD_RETRIES {
            let updated = tokio::time::timeout(self.op_timeout, async {
                self.heads
                    .update_one(
                        doc! {
                            "session_key": session_key.as_str(),
                            "sequence_no": { "$lt": target },
                        },
                        doc! {
                            "$set": { "sequence_no": target },
                            "$currentDate": { "last_written_at": true },
                        },
                    )
                    .upsert(true)
                    .await
            })
            .await
            .map_err(|_| timed_out("advance_head", self.op_timeout))?;

            match updated {
                Ok(_) => return Ok(()),
                Err(e) if error_code(&e) == Some(DUPLICATE_KEY) => {
                    match self.head_sequence(session_key).await? {
                        Some(current) if current >= sequence_no => {
                            return Err(stale(session_key, sequence_no, current));
                        }
                        _ => continue,
                    }
                }
                Err(e) => return Err(map_mongo_error("advance_head", e)),
            }
        }
        Err(ThreadkeepError::Backend(format!(
            "mongodb advance_head: head of '{session_key}' kept changing"
        )))
    }

    /// Re-stamps `last_written_at` on every document of the session.
    ///
    /// Failures are logged; the write that triggered the refresh has already
    /// landed.
    async fn touch_session(&self, session_key: &SessionKey) {
        let filter = doc! { "session_key": session_key.as_str() };
        let stamp = doc! { "$currentDate": { "last_written_at": true } };
        let touched = self
            .bounded("touch_session", async {
                self.checkpoints
                    .update_many(filter.clone(), stamp.clone())
                    .await?;
                self.writes.update_many(filter.clone(), stamp.clone()).await?;
                self.heads.update_one(filter.clone(), stamp.clone()).await
            })
            .await;
        if let Err(e) = touched {
            warn!(session_key = %session_key, error = %e, "Refreshing session expiry failed");
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = mongodb::error::Result<T>>,
    ) -> ThreadkeepResult<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_mongo_error(op, e)),
            Err(_) => Err(timed_out(op, self.op_timeout)),
        }
    }
}

#[async_trait]
impl CheckpointStore for MongoStore {
    fn backend_name(&self) -> &'static str {
        "mongodb"
    }

    async fn put_checkpoint(
        &self,
        session_key: &SessionKey,
        checkpoint: &Checkpoint,
    ) -> ThreadkeepResult<()> {
        let document = CheckpointDocument::from_checkpoint(checkpoint)?;
        self.advance_head(session_key, checkpoint.sequence_no).await?;

        let inserted = tokio::time::timeout(self.op_timeout, async {
            self.checkpoints.insert_one(document).await
        })
        .await
        .map_err(|_| timed_out("put_checkpoint", self.op_timeout))?;
        match inserted {
            Ok(_) => {
                self.touch_session(session_key).await;
                debug!(session_key = %session_key, sequence_no = checkpoint.sequence_no, "Checkpoint written to mongodb");
                Ok(())
            }
            Err(e) if error_code(&e) == Some(DUPLICATE_KEY) => Err(stale(
                session_key,
                checkpoint.sequence_no,
                checkpoint.sequence_no,
            )),
            Err(e) => Err(map_mongo_error("put_checkpoint", e)),
        }
    }

    async fn get_latest_checkpoint(
        &self,
        session_key: &SessionKey,
    ) -> ThreadkeepResult<Option<Checkpoint>> {
        self.latest_document(session_key)
            .await?
            .map(CheckpointDocument::into_checkpoint)
            .transpose()
    }

    async fn put_pending_write(
        &self,
        session_key: &SessionKey,
        write: &PendingWrite,
    ) -> ThreadkeepResult<()> {
        if let Some(current) = self.head_sequence(session_key).await? {
            if write.sequence_no <= current {
                return Err(stale(session_key, write.sequence_no, current));
            }
        }

        let document = PendingWriteDocument::from_write(write)?;
        let slot = doc! {
            "session_key": document.session_key.as_str(),
            "sequence_no": document.sequence_no,
            "channel": document.channel.as_str(),
        };
        let inserted = tokio::time::timeout(self.op_timeout, async {
            self.writes.insert_one(document).await
        })
        .await
        .map_err(|_| timed_out("put_pending_write", self.op_timeout))?;
        match inserted {
            Ok(_) => {}
            Err(e) if error_code(&e) == Some(DUPLICATE_KEY) => {
                return Err(stale(session_key, write.sequence_no, write.sequence_no));
            }
            Err(e) => return Err(map_mongo_error("put_pending_write", e)),
        }

        // A checkpoint at or above this sequence may have landed between the
        // head check and the insert. Take the write back in that case.
        if let Some(current) = self.head_sequence(session_key).await? {
            if write.sequence_no <= current {
                self.bounded("put_pending_write", async {
                    self.writes.delete_one(slot).await
                })
                .await?;
                return Err(stale(session_key, write.sequence_no, current));
            }
        }

        self.touch_session(session_key).await;
        Ok(())
    }

    async fn get_pending_writes(
        &self,
        session_key: &SessionKey,
        since_sequence: u64,
    ) -> ThreadkeepResult<Vec<PendingWrite>> {
        let since = to_i64(since_sequence)?;
        let documents: Vec<PendingWriteDocument> = self
            .bounded("get_pending_writes", async {
                let cursor = self
                    .writes
                    .find(doc! {
                        "session_key": session_key.as_str(),
                        "sequence_no": { "$gt": since },
                    })
                    .sort(doc! { "sequence_no": 1, "channel": 1 })
                    .await?;
                cursor.try_collect().await
            })
            .await?;
        documents
            .into_iter()
            .map(PendingWriteDocument::into_write)
            .collect()
    }

    async fn prune_pending_writes(
        &self,
        session_key: &SessionKey,
        up_to_sequence: u64,
    ) -> ThreadkeepResult<usize> {
        let up_to = to_i64(up_to_sequence)?;
        let result = self
            .bounded("prune_pending_writes", async {
                self.writes
                    .delete_many(doc! {
                        "session_key": session_key.as_str(),
                        "sequence_no": { "$lte": up_to },
                    })
                    .await
            })
            .await?;
        Ok(usize::try_from(result.deleted_count).unwrap_or(usize::MAX))
    }

    async fn delete_session(&self, session_key: &SessionKey) -> ThreadkeepResult<()> {
        let filter = doc! { "session_key": session_key.as_str() };
        let checkpoints = self
            .bounded("delete_session", async {
                self.checkpoints.delete_many(filter.clone()).await
            })
            .await?;
        let writes = self
            .bounded("delete_session", async {
                self.writes.delete_many(filter.clone()).await
            })
            .await?;
        self.bounded("delete_session", async {
            self.heads.delete_one(filter.clone()).await
        })
        .await?;
        debug!(
            session_key = %session_key,
            checkpoints = checkpoints.deleted_count,
            writes = writes.deleted_count,
            "Session deleted from mongodb"
        );
        Ok(())
    }
}

fn to_i64(sequence_no: u64) -> ThreadkeepResult<i64> {
    i64::try_from(sequence_no).map_err(|_| {
        ThreadkeepError::Backend(format!("sequence {sequence_no} does not fit a BSON int64"))
    })
}

fn stale(session_key: &SessionKey, attempted: u64, current: u64) -> ThreadkeepError {
    ThreadkeepError::StaleWrite {
        session_key: session_key.to_string(),
        attempted,
        current,
    }
}

fn error_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        _ => None,
    }
}

fn map_mongo_error(op: &str, err: MongoError) -> ThreadkeepError {
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => {
            ThreadkeepError::BackendUnavailable(format!("mongodb {op}: {err}"))
        }
        _ => ThreadkeepError::Backend(format!("mongodb {op}: {err}")),
    }
}

fn timed_out(op: &str, after: Duration) -> ThreadkeepError {
    ThreadkeepError::BackendUnavailable(format!("mongodb {op} timed out after {after:?}"))
}
