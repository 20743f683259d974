use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, info};

use crate::error::{BatchError, Result};

use super::job::{Job, JobId, JobPatch, JobStatus};
use super::queue::JobQueue;
use super::store::JobStore;

pub const QUEUE_PREFIX: &str = "batch:queue:";
pub const QUEUE_INDEX: &str = "batch:queues";
pub const JOB_PREFIX: &str = "batch:jobs:";
pub const WIP_USERS: &str = "batch:wip:users";
pub const WIP_USER_PREFIX: &str = "batch:wip:user:";

/// Lua scripts keeping list contents and their indexes in step.
mod scripts {
    use redis::Script;

    pub fn enqueue() -> Script {
        Script::new(
            r#"
            redis.call(ARGV[3], KEYS[1], ARGV[1])
            redis.call('SADD', KEYS[2], ARGV[2])
            return redis.call('LLEN', KEYS[1])
            "#,
        )
    }

    pub fn dequeue() -> Script {
        Script::new(
            r#"
            local job_id = redis.call('LPOP', KEYS[1])
            if redis.call('LLEN', KEYS[1]) == 0 then
                redis.call('SREM', KEYS[2], ARGV[1])
            end
            return job_id
            "#,
        )
    }

    /// Compare-and-set on the stored status. Replies `{0, ''}` when the job
    /// is missing, `{1, status}` on a status mismatch, `{2, json}` on success.
    pub fn transition() -> Script {
        Script::new(
            r#"
            local raw = redis.call('GET', KEYS[1])
            if not raw then
                return {0, ''}
            end
            local job = cjson.decode(raw)
            if job.status ~= ARGV[1] then
                return {1, job.status}
            end
            job.status = ARGV[2]
            for field, value in pairs(cjson.decode(ARGV[3])) do
                job[field] = value
            end
            local encoded = cjson.encode(job)
            redis.call('SET', KEYS[1], encoded)
            local ttl = tonumber(ARGV[4])
            if ttl > 0 then
                redis.call('EXPIRE', KEYS[1], ttl)
            end
            return {2, encoded}
            "#,
        )
    }

    /// Drops a user from the index only if its list is still empty.
    pub fn forget_if_empty() -> Script {
        Script::new(
            r#"
            if redis.call('LLEN', KEYS[1]) == 0 then
                return redis.call('SREM', KEYS[2], ARGV[1])
            end
            return 0
            "#,
        )
    }

    pub fn clear_work_in_progress() -> Script {
        Script::new(
            r#"
            redis.call('LREM', KEYS[1], 0, ARGV[1])
            if redis.call('LLEN', KEYS[1]) == 0 then
                redis.call('SREM', KEYS[2], ARGV[2])
            end
            return 1
            "#,
        )
    }
}

pub fn queue_key(user: &str) -> String {
    format!("{QUEUE_PREFIX}{user}")
}

pub fn job_key(job_id: &JobId) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

pub fn wip_key(user: &str) -> String {
    format!("{WIP_USER_PREFIX}{user}")
}

fn user_from_queue_key(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_PREFIX).filter(|user| !user.is_empty())
}

fn queue_err(action: &str, err: redis::RedisError) -> BatchError {
    BatchError::Queue(format!("{action} failed: {err}"))
}

pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Per-user Redis lists plus a set indexing the users with queued work.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("prefix", &QUEUE_PREFIX)
            .finish()
    }
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn push(&self, user: &str, job_id: &JobId, command: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let len: i64 = scripts::enqueue()
            .key(queue_key(user))
            .key(QUEUE_INDEX)
            .arg(job_id.to_string())
            .arg(user)
            .arg(command)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| queue_err(command, e))?;
        debug!(target: "batch::queue", user = %user, job_id = %job_id, len, command, "job queued");
        Ok(())
    }

    /// Returns whether the index entry was removed. A user whose queue was
    /// refilled since the caller looked keeps its entry.
    async fn forget_if_empty(&self, user: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = scripts::forget_if_empty()
            .key(queue_key(user))
            .key(QUEUE_INDEX)
            .arg(user)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| queue_err("SREM", e))?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, user: &str, job_id: &JobId) -> Result<()> {
        self.push(user, job_id, "RPUSH").await
    }

    async fn enqueue_first(&self, user: &str, job_id: &JobId) -> Result<()> {
        self.push(user, job_id, "LPUSH").await
    }

    async fn dequeue(&self, user: &str) -> Result<Option<JobId>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = scripts::dequeue()
            .key(queue_key(user))
            .key(QUEUE_INDEX)
            .arg(user)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| queue_err("LPOP", e))?;

        raw.map(|id| id.parse::<JobId>()).transpose()
    }

    async fn scan_queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{QUEUE_PREFIX}*");
        let mut found = BTreeSet::new();

        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| queue_err("SCAN", e))?;

            for key in keys {
                let Some(user) = user_from_queue_key(&key) else {
                    continue;
                };
                let len: usize = conn.llen(&key).await.map_err(|e| queue_err("LLEN", e))?;
                if len > 0 {
                    found.insert(user.to_string());
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // Rebuild the index from what is actually queued.
        let indexed: BTreeSet<String> = conn
            .smembers(QUEUE_INDEX)
            .await
            .map_err(|e| queue_err("SMEMBERS", e))?;
        let stale: Vec<&String> = indexed.difference(&found).collect();
        let missing: Vec<&String> = found.difference(&indexed).collect();
        let mut forgotten = 0;
        for user in &stale {
            if self.forget_if_empty(user).await? {
                forgotten += 1;
            }
        }
        if !missing.is_empty() {
            conn.sadd::<_, _, ()>(QUEUE_INDEX, &missing)
                .await
                .map_err(|e| queue_err("SADD", e))?;
        }
        info!(
            target: "batch::queue",
            users = found.len(),
            repaired = forgotten + missing.len(),
            "queue scan complete"
        );

        Ok(found.into_iter().collect())
    }

    async fn get_queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let users: BTreeSet<String> = conn
            .smembers(QUEUE_INDEX)
            .await
            .map_err(|e| queue_err("SMEMBERS", e))?;
        Ok(users.into_iter().collect())
    }

    async fn size(&self, user: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(queue_key(user))
            .await
            .map_err(|e| queue_err("LLEN", e))
    }
}

/// Job records as JSON documents, with Lua compare-and-set transitions.
/// Finished records expire after `finished_ttl`.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    finished_ttl: Duration,
}

impl fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("finished_ttl", &self.finished_ttl)
            .finish()
    }
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager, finished_ttl: Duration) -> Self {
        Self { conn, finished_ttl }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        conn.set::<_, _, ()>(job_key(&job.job_id), payload).await?;
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Job> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(job_key(job_id)).await?;
        let raw = raw.ok_or(BatchError::JobNotFound(*job_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn transition(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
        patch: &JobPatch,
    ) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(BatchError::InvalidTransition {
                job_id: *job_id,
                from,
                to,
            });
        }

        let ttl = if to.is_terminal() {
            self.finished_ttl.as_secs()
        } else {
            0
        };
        let mut conn = self.conn.clone();
        let (code, body): (i64, String) = scripts::transition()
            .key(job_key(job_id))
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(serde_json::to_string(patch)?)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;

        match code {
            0 => Err(BatchError::JobNotFound(*job_id)),
            1 => Err(BatchError::InvalidTransition {
                job_id: *job_id,
                from: body.parse()?,
                to,
            }),
            _ => Ok(serde_json::from_str(&body)?),
        }
    }

    async fn add_work_in_progress(&self, user: &str, job_id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .rpush(wip_key(user), job_id.to_string())
            .ignore()
            .sadd(WIP_USERS, user)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_work_in_progress(&self, user: &str, job_id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        scripts::clear_work_in_progress()
            .key(wip_key(user))
            .key(WIP_USERS)
            .arg(job_id.to_string())
            .arg(user)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_work_in_progress(&self) -> Result<Vec<(String, JobId)>> {
        let mut conn = self.conn.clone();
        let users: BTreeSet<String> = conn.smembers(WIP_USERS).await?;

        let mut entries = Vec::new();
        for user in users {
            let ids: Vec<String> = conn.lrange(wip_key(&user), 0, -1).await?;
            for id in ids {
                entries.push((user.clone(), id.parse()?));
            }
        }
        Ok(entries)
    }
}
