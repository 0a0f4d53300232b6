use crate::config::RedisConfig;
use crate::store::{sort_pending, CheckpointStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use threadkeep_core::{
    Checkpoint, PendingWrite, SessionKey, ThreadkeepError, ThreadkeepResult, TtlPolicy,
};
use tracing::{debug, info};

// KEYS[1] checkpoint hash, KEYS[2] writes hash.
// ARGV: sequence, checkpoint json, ttl ms. Returns -1 or the current sequence.
const PUT_CHECKPOINT_LUA: &str = r"
local current = redis.call('HGET', KEYS[1], 'seq')
if current and tonumber(current) >= tonumber(ARGV[1]) then
  return tonumber(current)
end
redis.call('HSET', KEYS[1], 'seq', ARGV[1], 'data', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('PEXPIRE', KEYS[2], ARGV[3])
return -1
";

// KEYS[1] checkpoint hash, KEYS[2] writes hash.
// ARGV: sequence, field, write json, ttl ms. Returns -1 or the conflicting sequence.
const PUT_PENDING_WRITE_LUA: &str = r"
local current = redis.call('HGET', KEYS[1], 'seq')
if current and tonumber(current) >= tonumber(ARGV[1]) then
  return tonumber(current)
end
if redis.call('HSETNX', KEYS[2], ARGV[2], ARGV[3]) == 0 then
  return tonumber(ARGV[1])
end
redis.call('PEXPIRE', KEYS[2], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return -1
";

// KEYS[1] writes hash. ARGV: highest sequence to remove. Returns the count removed.
const PRUNE_PENDING_WRITES_LUA: &str = r"
local removed = 0
for _, field in ipairs(redis.call('HKEYS', KEYS[1])) do
  local seq = tonumber(string.match(field, '^(%d+):'))
  if seq and seq <= tonumber(ARGV[1]) then
    removed = removed + redis.call('HDEL', KEYS[1], field)
  end
end
return removed
";

/// Redis-backed checkpoint store with TTL.
///
/// Each session owns two keys: a hash holding the latest checkpoint and its
/// sequence, and a hash of pending writes keyed by `sequence:channel`. Writes
/// run as Lua scripts, so the stale-sequence check and the write are one
/// atomic step, and every write resets the expiry of both keys. With
/// `refresh_on_read`, reads reset it too (sliding window).
///
/// Expiry is point-in-time: Redis never returns an expired key.
pub struct RedisStore {
    conn: MultiplexedConnection,
    namespace: String,
    ttl: TtlPolicy,
    op_timeout: Duration,
    put_checkpoint_script: Script,
    put_pending_write_script: Script,
    prune_script: Script,
}

impl RedisStore {
    /// Opens a multiplexed connection and pings the server.
    pub async fn connect(config: &RedisConfig) -> ThreadkeepResult<Self> {
        config.validate()?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| ThreadkeepError::Config(format!("Invalid redis url: {e}")))?;
        let op_timeout = config.op_timeout();

        let conn = match tokio::time::timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(map_redis_error("connect", e)),
            Err(_) => return Err(timed_out("connect", op_timeout)),
        };

        let store = Self {
            conn,
            namespace: config.namespace.clone(),
            ttl: config.ttl_policy(),
            op_timeout,
            put_checkpoint_script: Script::new(PUT_CHECKPOINT_LUA),
            put_pending_write_script: Script::new(PUT_PENDING_WRITE_LUA),
            prune_script: Script::new(PRUNE_PENDING_WRITES_LUA),
        };

        let mut conn = store.conn.clone();
        let _: String = store
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;

        info!(
            namespace = %store.namespace,
            ttl_secs = store.ttl.default_ttl.as_secs(),
            refresh_on_read = store.ttl.refresh_on_read,
            "Connected to redis"
        );
        Ok(store)
    }

    /// The TTL policy applied to every session.
    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> ThreadkeepResult<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_error(op, e)),
            Err(_) => Err(timed_out(op, self.op_timeout)),
        }
    }
}

#[async_trait]
impl CheckpointStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn put_checkpoint(
        &self,
        session_key: &SessionKey,
        checkpoint: &Checkpoint,
    ) -> ThreadkeepResult<()> {
        let data = serde_json::to_string(checkpoint)?;
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .bounded(
                "put_checkpoint",
                self.put_checkpoint_script
                    .key(checkpoint_key(&self.namespace, session_key))
                    .key(writes_key(&self.namespace, session_key))
                    .arg(checkpoint.sequence_no)
                    .arg(data)
                    .arg(self.ttl.ttl_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        check_outcome(session_key, checkpoint.sequence_no, outcome)?;
        debug!(session_key = %session_key, sequence_no = checkpoint.sequence_no, "Checkpoint written to redis");
        Ok(())
    }

    async fn get_latest_checkpoint(
        &self,
        session_key: &SessionKey,
    ) -> ThreadkeepResult<Option<Checkpoint>> {
        let ckey = checkpoint_key(&self.namespace, session_key);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HGET").arg(&ckey).arg("data");
        if self.ttl.refresh_on_read {
            add_refresh(&mut pipe, &self.namespace, session_key, self.ttl.ttl_millis());
        }
        let mut conn = self.conn.clone();
        let (data,): (Option<String>,) = self
            .bounded("get_latest_checkpoint", pipe.query_async(&mut conn))
            .await?;
        data.map(|json| serde_json::from_str(&json).map_err(ThreadkeepError::from))
            .transpose()
    }

    async fn put_pending_write(
        &self,
        session_key: &SessionKey,
        write: &PendingWrite,
    ) -> ThreadkeepResult<()> {
        let data = serde_json::to_string(write)?;
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .bounded(
                "put_pending_write",
                self.put_pending_write_script
                    .key(checkpoint_key(&self.namespace, session_key))
                    .key(writes_key(&self.namespace, session_key))
                    .arg(write.sequence_no)
                    .arg(write_field(write.sequence_no, &write.channel))
                    .arg(data)
                    .arg(self.ttl.ttl_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        check_outcome(session_key, write.sequence_no, outcome)
    }

    async fn get_pending_writes(
        &self,
        session_key: &SessionKey,
        since_sequence: u64,
    ) -> ThreadkeepResult<Vec<PendingWrite>> {
        let wkey = writes_key(&self.namespace, session_key);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HVALS").arg(&wkey);
        if self.ttl.refresh_on_read {
            add_refresh(&mut pipe, &self.namespace, session_key, self.ttl.ttl_millis());
        }
        let mut conn = self.conn.clone();
        let (raw,): (Vec<String>,) = self
            .bounded("get_pending_writes", pipe.query_async(&mut conn))
            .await?;

        let mut writes = Vec::with_capacity(raw.len());
        for json in raw {
            let write: PendingWrite = serde_json::from_str(&json)?;
            if write.sequence_no > since_sequence {
                writes.push(write);
            }
        }
        sort_pending(&mut writes);
        Ok(writes)
    }

    async fn prune_pending_writes(
        &self,
        session_key: &SessionKey,
        up_to_sequence: u64,
    ) -> ThreadkeepResult<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = self
            .bounded(
                "prune_pending_writes",
                self.prune_script
                    .key(writes_key(&self.namespace, session_key))
                    .arg(up_to_sequence)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed)
    }

    async fn delete_session(&self, session_key: &SessionKey) -> ThreadkeepResult<()> {
        let mut conn = self.conn.clone();
        let removed: usize = self
            .bounded(
                "delete_session",
                redis::cmd("DEL")
                    .arg(checkpoint_key(&self.namespace, session_key))
                    .arg(writes_key(&self.namespace, session_key))
                    .query_async(&mut conn),
            )
            .await?;
        debug!(session_key = %session_key, removed, "Session deleted from redis");
        Ok(())
    }
}

// The hash tag keeps both keys of a session in one cluster slot.
fn checkpoint_key(namespace: &str, session_key: &SessionKey) -> String {
    format!("{namespace}:{{{session_key}}}:checkpoint")
}

fn writes_key(namespace: &str, session_key: &SessionKey) -> String {
    format!("{namespace}:{{{session_key}}}:writes")
}

fn write_field(sequence_no: u64, channel: &str) -> String {
    format!("{sequence_no}:{channel}")
}

fn add_refresh(pipe: &mut redis::Pipeline, namespace: &str, session_key: &SessionKey, ttl_ms: u64) {
    pipe.cmd("PEXPIRE")
        .arg(checkpoint_key(namespace, session_key))
        .arg(ttl_ms)
        .ignore()
        .cmd("PEXPIRE")
        .arg(writes_key(namespace, session_key))
        .arg(ttl_ms)
        .ignore();
}

fn check_outcome(session_key: &SessionKey, attempted: u64, outcome: i64) -> ThreadkeepResult<()> {
    if outcome < 0 {
        return Ok(());
    }
    Err(ThreadkeepError::StaleWrite {
        session_key: session_key.to_string(),
        attempted,
        current: outcome.unsigned_abs(),
    })
}

fn map_redis_error(op: &str, err: RedisError) -> ThreadkeepError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
    {
        ThreadkeepError::BackendUnavailable(format!("redis {op}: {err}"))
    } else {
        ThreadkeepError::Backend(format!("redis {op}: {err}"))
    }
}

fn timed_out(op: &str, after: Duration) -> ThreadkeepError {
    ThreadkeepError::BackendUnavailable(format!("redis {op} timed out after {after:?}"))
}
