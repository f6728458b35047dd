//! Redis-backed priority queue.
//!
//! Layout under `meal_analysis:<queue>`:
//!
//! - `:job:<id>`        hash with one field per job attribute
//! - `:wait`            ZSET of claimable ids, score `priority * 1e13 + seq`
//! - `:delayed`         ZSET of ids in retry backoff, score = ready-at ms
//! - `:expiry`          ZSET of pending ids, score = expires-at ms
//! - `:active`          SET of claimed ids
//! - `:completed`       ZSET, score = finished-at ms
//! - `:failed`          ZSET, score = finished-at ms
//! - `:owner:<owner>`   ZSET of the owner's ids, score = created-at ms
//! - `:seq`             FIFO counter within a priority
//! - `:paused`          present while the queue is paused
//!
//! Claim and every status change run as single Lua scripts, so exclusivity
//! holds across any number of worker processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueSettings, QueueStats};
use crate::models::job::{AnalysisJob, BatchProgress, JobId, JobStatus, NewJob};
use crate::services::store::{is_legal, Transition};

const KEY_PREFIX: &str = "meal_analysis";

/// Priorities are packed above this multiplier so the sequence keeps FIFO
/// order inside a priority band.
const PRIORITY_SCALE: f64 = 1e13;

const CLAIM_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[4]) == 1 then return {} end
local now = tonumber(ARGV[1])
local ready = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(ready) do
  redis.call('ZREM', KEYS[2], id)
  local score = redis.call('HGET', ARGV[6] .. id, 'wait_score')
  if score then redis.call('ZADD', KEYS[1], score, id) end
end
local limit = tonumber(ARGV[2])
local claimed = {}
local n = 0
while n < limit do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then break end
  local id = popped[1]
  local key = ARGV[6] .. id
  local status = redis.call('HGET', key, 'status')
  local expires = tonumber(redis.call('HGET', key, 'expires_ms') or '0')
  if status == 'PENDING' and expires > now then
    n = n + 1
    redis.call('HSET', key,
      'status', 'PROCESSING',
      'claim_token', ARGV[6 + n],
      'started_at', ARGV[3],
      'lease_expires_at', ARGV[4],
      'lease_ms', ARGV[5],
      'updated_at', ARGV[3])
    redis.call('ZREM', KEYS[5], id)
    redis.call('SADD', KEYS[3], id)
    table.insert(claimed, id)
  end
end
return claimed
"#;

const TRANSITION_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 0 end
if status ~= ARGV[2] then return -1 end
if ARGV[3] ~= '' and redis.call('HGET', KEYS[1], 'claim_token') ~= ARGV[3] then return -1 end
local id = ARGV[1]
redis.call('SREM', KEYS[4], id)
redis.call('ZREM', KEYS[2], id)
redis.call('ZREM', KEYS[3], id)
redis.call('ZREM', KEYS[7], id)
if tonumber(ARGV[6]) > 0 then redis.call('HINCRBY', KEYS[1], 'retry_count', ARGV[6]) end
local i = 8
for _ = 1, tonumber(ARGV[7]) do
  redis.call('HDEL', KEYS[1], ARGV[i])
  i = i + 1
end
while i + 1 <= #ARGV do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
local place = ARGV[4]
if place == 'wait' then
  redis.call('ZADD', KEYS[2], redis.call('HGET', KEYS[1], 'wait_score'), id)
  redis.call('ZADD', KEYS[7], redis.call('HGET', KEYS[1], 'expires_ms'), id)
elseif place == 'delayed' then
  redis.call('ZADD', KEYS[3], ARGV[5], id)
  redis.call('ZADD', KEYS[7], redis.call('HGET', KEYS[1], 'expires_ms'), id)
elseif place == 'completed' then
  redis.call('ZADD', KEYS[5], ARGV[5], id)
elseif place == 'failed' then
  redis.call('ZADD', KEYS[6], ARGV[5], id)
end
return 1
"#;

/// HSET pairs only while the job is still held by the given claim token.
const GUARDED_SET_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'PROCESSING' then return 0 end
if redis.call('HGET', KEYS[1], 'claim_token') ~= ARGV[1] then return 0 end
local i = 2
while i + 1 <= #ARGV do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
return 1
"#;

/// Waiting and delayed counts as of ARGV[1]. Expired ids are left out, and
/// delayed ids whose backoff has passed count as waiting.
const STATS_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local waiting = redis.call('ZCARD', KEYS[1]) + redis.call('ZCOUNT', KEYS[2], '-inf', now)
local delayed = redis.call('ZCOUNT', KEYS[2], '(' .. now, '+inf')
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)) do
  if redis.call('ZSCORE', KEYS[1], id) then
    waiting = waiting - 1
  else
    local ready = redis.call('ZSCORE', KEYS[2], id)
    if ready then
      if tonumber(ready) <= now then waiting = waiting - 1 else delayed = delayed - 1 end
    end
  end
end
return {waiting, delayed}
"#;

/// Stamp `resubmitted_at` on a failed job exactly once.
const MARK_RESUBMITTED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'FAILED' then return 0 end
if redis.call('HSETNX', KEYS[1], 'resubmitted_at', ARGV[1]) == 0 then return 0 end
return 1
"#;

/// Delete jobs listed in the given sorted sets (below a score), along with
/// their owner index entries.
const DELETE_SCRIPT: &str = r#"
local removed = 0
for k = 1, #KEYS do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[k], '-inf', ARGV[k + 1])
  for _, id in ipairs(ids) do
    local key = ARGV[1] .. 'job:' .. id
    local owner = redis.call('HGET', key, 'owner_id')
    if owner then redis.call('ZREM', ARGV[1] .. 'owner:' .. owner, id) end
    redis.call('DEL', key)
    redis.call('ZREM', KEYS[k], id)
    redis.call('ZREM', ARGV[1] .. 'expiry', id)
    removed = removed + 1
  end
end
return removed
"#;

/// Where a job lands after a transition.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Placement {
    Wait,
    Delayed(i64),
    Completed(i64),
    Failed(i64),
}

impl Placement {
    fn for_transition(to: JobStatus, available_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match to {
            JobStatus::Pending => match available_at {
                Some(at) if at > now => Placement::Delayed(at.timestamp_millis()),
                _ => Placement::Wait,
            },
            JobStatus::Completed => Placement::Completed(now.timestamp_millis()),
            JobStatus::Failed => Placement::Failed(now.timestamp_millis()),
            // Claims go through the claim script.
            JobStatus::Processing => Placement::Wait,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Placement::Wait => "wait",
            Placement::Delayed(_) => "delayed",
            Placement::Completed(_) => "completed",
            Placement::Failed(_) => "failed",
        }
    }

    fn score(&self) -> i64 {
        match self {
            Placement::Wait => 0,
            Placement::Delayed(ms) | Placement::Completed(ms) | Placement::Failed(ms) => *ms,
        }
    }
}

fn wait_score(priority: i32, seq: i64) -> f64 {
    priority.max(0) as f64 * PRIORITY_SCALE + seq as f64
}

/// Broker-backed job queue with tier priorities.
pub struct BrokerQueue {
    client: redis::Client,
    name: String,
    settings: QueueSettings,
    claim_script: redis::Script,
    transition_script: redis::Script,
    guarded_set_script: redis::Script,
    stats_script: redis::Script,
    mark_resubmitted_script: redis::Script,
    delete_script: redis::Script,
}

impl BrokerQueue {
    pub fn new(
        redis_url: &str,
        name: impl Into<String>,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            name: name.into(),
            settings,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            transition_script: redis::Script::new(TRANSITION_SCRIPT),
            guarded_set_script: redis::Script::new(GUARDED_SET_SCRIPT),
            stats_script: redis::Script::new(STATS_SCRIPT),
            mark_resubmitted_script: redis::Script::new(MARK_RESUBMITTED_SCRIPT),
            delete_script: redis::Script::new(DELETE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    fn prefix(&self) -> String {
        format!("{}:{}:", KEY_PREFIX, self.name)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix(), suffix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}job:{}", self.prefix(), id)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}owner:{}", self.prefix(), owner_id)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &str,
    ) -> Result<Option<AnalysisJob>, QueueError> {
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(id, &fields).map(Some)
    }

    async fn load_many(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: &[String],
    ) -> Result<Vec<AnalysisJob>, QueueError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(conn, id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn guarded_set(
        &self,
        id: &JobId,
        claim_token: Uuid,
        pairs: &[(&str, String)],
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.guarded_set_script.key(self.job_key(id.as_str()));
        invocation.arg(claim_token.to_string());
        for (field, value) in pairs {
            invocation.arg(*field).arg(value);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        if applied == 1 {
            Ok(())
        } else {
            Err(QueueError::Conflict { id: id.clone() })
        }
    }
}

#[async_trait]
impl JobQueue for BrokerQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn owns(&self, id: &JobId) -> bool {
        id.as_str()
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|hex| hex.len() == 32 && Uuid::try_parse(hex).is_ok())
    }

    async fn submit(&self, job: NewJob) -> Result<AnalysisJob, QueueError> {
        let mut conn = self.conn().await?;
        let id = JobId::new(format!("{}-{}", self.name, Uuid::new_v4().simple()));
        let now = Utc::now();
        let created = AnalysisJob::pending(id.clone(), job, now, self.settings.job_expiry);

        let seq: i64 = conn.incr(self.key("seq"), 1).await?;
        let score = wait_score(created.priority, seq);
        let mut fields = job_to_fields(&created)?;
        fields.push(("wait_score", score.to_string()));

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(id.as_str()), fields.as_slice())
            .ignore()
            .zadd(self.key("wait"), id.as_str(), score)
            .ignore()
            .zadd(self.key("expiry"), id.as_str(), created.expires_at.timestamp_millis())
            .ignore()
            .zadd(
                self.owner_key(&created.owner_id),
                id.as_str(),
                now.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::info!(
            queue = %self.name,
            job_id = %created.id,
            owner_id = %created.owner_id,
            priority = created.priority,
            items = created.input.item_count(),
            "Job enqueued"
        );
        Ok(created)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<AnalysisJob>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let lease_until = now + self.settings.lease;

        let mut invocation = self.claim_script.key(self.key("wait"));
        invocation
            .key(self.key("delayed"))
            .key(self.key("active"))
            .key(self.key("paused"))
            .key(self.key("expiry"))
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(now.to_rfc3339())
            .arg(lease_until.to_rfc3339())
            .arg(lease_until.timestamp_millis())
            .arg(format!("{}job:", self.prefix()));
        for _ in 0..limit {
            invocation.arg(Uuid::new_v4().to_string());
        }

        let ids: Vec<String> = invocation.invoke_async(&mut conn).await?;
        self.load_many(&mut conn, &ids).await
    }

    async fn transition(&self, id: &JobId, change: Transition) -> Result<AnalysisJob, QueueError> {
        if !is_legal(change.expected, change.to) {
            return Err(QueueError::IllegalTransition {
                from: change.expected,
                to: change.to,
            });
        }

        let mut conn = self.conn().await?;
        let now = Utc::now();
        let placement = Placement::for_transition(change.to, change.available_at, now);

        let mut deletes: Vec<&str> = Vec::new();
        if change.to != JobStatus::Processing {
            deletes.extend(["claim_token", "lease_expires_at", "lease_ms"]);
        }
        if !change.to.is_terminal() {
            deletes.push("completed_at");
        }

        let mut pairs: Vec<(&str, String)> = vec![
            ("status", change.to.to_string()),
            ("updated_at", now.to_rfc3339()),
        ];
        if change.to.is_terminal() {
            pairs.push(("completed_at", now.to_rfc3339()));
        }
        if let Some(result) = &change.result {
            pairs.push(("result", serde_json::to_string(result)?));
        }
        if let Some(error) = &change.error {
            pairs.push(("error", error.clone()));
        }
        if let Some(at) = change.available_at {
            pairs.push(("available_at", at.to_rfc3339()));
        }

        let expected: &str = change.expected.as_ref();
        let mut invocation = self.transition_script.key(self.job_key(id.as_str()));
        invocation
            .key(self.key("wait"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .key(self.key("completed"))
            .key(self.key("failed"))
            .key(self.key("expiry"))
            .arg(id.as_str())
            .arg(expected)
            .arg(change.claim_token.map(|t| t.to_string()).unwrap_or_default())
            .arg(placement.name())
            .arg(placement.score())
            .arg(if change.increment_retry { 1 } else { 0 })
            .arg(deletes.len());
        for field in &deletes {
            invocation.arg(*field);
        }
        for (field, value) in &pairs {
            invocation.arg(*field).arg(value);
        }

        let outcome: i64 = invocation.invoke_async(&mut conn).await?;
        match outcome {
            1 => self.load(&mut conn, id.as_str()).await?.ok_or(QueueError::NotFound),
            0 => Err(QueueError::NotFound),
            _ => Err(QueueError::Conflict { id: id.clone() }),
        }
    }

    async fn renew_lease(&self, id: &JobId, claim_token: Uuid) -> Result<(), QueueError> {
        let until = Utc::now() + self.settings.lease;
        self.guarded_set(
            id,
            claim_token,
            &[
                ("lease_expires_at", until.to_rfc3339()),
                ("lease_ms", until.timestamp_millis().to_string()),
            ],
        )
        .await
    }

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
    ) -> Result<(), QueueError> {
        self.guarded_set(
            id,
            claim_token,
            &[
                ("progress", serde_json::to_string(&progress)?),
                ("updated_at", Utc::now().to_rfc3339()),
            ],
        )
        .await
    }

    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, QueueError> {
        let mut conn = self.conn().await?;
        let job = self.load(&mut conn, id.as_str()).await?;
        Ok(job.filter(|j| j.owner_id == owner_id))
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, QueueError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrevrange(self.owner_key(owner_id), 0, (limit - 1) as isize)
            .await?;
        self.load_many(&mut conn, &ids).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn().await?;
        let (waiting, delayed): (i64, i64) = self
            .stats_script
            .key(self.key("wait"))
            .key(self.key("delayed"))
            .key(self.key("expiry"))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        let (active, completed, failed, paused): (u64, u64, u64, bool) = redis::pipe()
            .scard(self.key("active"))
            .zcard(self.key("completed"))
            .zcard(self.key("failed"))
            .exists(self.key("paused"))
            .query_async(&mut conn)
            .await?;
        let (waiting, delayed) = (waiting.max(0) as u64, delayed.max(0) as u64);

        Ok(QueueStats {
            queue: self.name.clone(),
            waiting,
            delayed,
            active,
            completed,
            failed,
            paused,
        })
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.key("paused"), 1).await?;
        tracing::info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.key("paused")).await?;
        tracing::info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let removed: u64 = self
            .delete_script
            .key(self.key("wait"))
            .key(self.key("delayed"))
            .arg(self.prefix())
            .arg("+inf")
            .arg("+inf")
            .invoke_async(&mut conn)
            .await?;
        tracing::warn!(queue = %self.name, removed, "Queue cleared");
        Ok(removed)
    }

    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let wanted = limit as usize;
        let page = limit as isize;
        let mut conn = self.conn().await?;
        let mut found = Vec::with_capacity(wanted);
        let mut offset: isize = 0;

        // Resubmitted jobs stay in the failed set until retention removes them.
        loop {
            let ids: Vec<String> = conn
                .zrevrange(self.key("failed"), offset, offset + page - 1)
                .await?;
            if ids.is_empty() {
                return Ok(found);
            }
            offset += ids.len() as isize;
            for job in self.load_many(&mut conn, &ids).await? {
                if job.resubmitted_at.is_none() {
                    found.push(job);
                    if found.len() == wanted {
                        return Ok(found);
                    }
                }
            }
        }
    }

    async fn mark_resubmitted(&self, id: &JobId) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let marked: i64 = self
            .mark_resubmitted_script
            .key(self.job_key(id.as_str()))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(marked == 1)
    }

    async fn stale_leases(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let ids: Vec<String> = conn.smembers(self.key("active")).await?;
        let mut stale: Vec<AnalysisJob> = self
            .load_many(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.lease_expires_at.is_some_and(|lease| lease < now)
            })
            .collect();
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn expired_pending(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp_millis();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.key("expiry"), "-inf", now, 0, limit.max(0) as isize)
            .await?;
        Ok(self
            .load_many(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect())
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        // Exclusive upper bounds: keep anything finished exactly at the cutoff.
        let removed: u64 = self
            .delete_script
            .key(self.key("completed"))
            .key(self.key("failed"))
            .arg(self.prefix())
            .arg(format!("({}", completed_before.timestamp_millis()))
            .arg(format!("({}", failed_before.timestamp_millis()))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

fn opt_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

/// Flatten a job into hash fields. `None` values are omitted.
fn job_to_fields(job: &AnalysisJob) -> Result<Vec<(&'static str, String)>, QueueError> {
    let mut fields: Vec<(&'static str, String)> = vec![
        ("owner_id", job.owner_id.clone()),
        ("input", serde_json::to_string(&job.input)?),
        ("meal_type", job.meal_type.clone()),
        ("status", job.status.to_string()),
        ("retry_count", job.retry_count.to_string()),
        ("priority", job.priority.to_string()),
        ("created_at", job.created_at.to_rfc3339()),
        ("expires_at", job.expires_at.to_rfc3339()),
        ("expires_ms", job.expires_at.timestamp_millis().to_string()),
        ("available_at", job.available_at.to_rfc3339()),
        ("updated_at", job.updated_at.to_rfc3339()),
    ];

    let optional = [
        ("result", job.result.as_ref().map(serde_json::to_string).transpose()?),
        ("error", job.error.clone()),
        ("progress", job.progress.as_ref().map(serde_json::to_string).transpose()?),
        ("claim_token", job.claim_token.map(|t| t.to_string())),
        ("started_at", opt_time(job.started_at)),
        ("completed_at", opt_time(job.completed_at)),
        ("lease_expires_at", opt_time(job.lease_expires_at)),
        ("resubmitted_at", opt_time(job.resubmitted_at)),
    ];
    fields.extend(optional.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))));

    Ok(fields)
}

fn job_from_fields(id: &str, fields: &HashMap<String, String>) -> Result<AnalysisJob, QueueError> {
    let corrupt = |reason: String| QueueError::Corrupt {
        id: id.to_string(),
        reason,
    };
    let required = |name: &str| -> Result<&String, QueueError> {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field {name}")))
    };
    let time = |value: &str| -> Result<DateTime<Utc>, QueueError> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(e.to_string()))
    };
    let opt_time = |name: &str| -> Result<Option<DateTime<Utc>>, QueueError> {
        fields.get(name).map(|v| time(v.as_str())).transpose()
    };
    let number = |name: &str| -> Result<i32, QueueError> {
        required(name)?
            .parse::<i32>()
            .map_err(|e| corrupt(format!("{name}: {e}")))
    };

    let status = required("status")?
        .parse::<JobStatus>()
        .map_err(|e| corrupt(e.to_string()))?;
    let claim_token = fields
        .get("claim_token")
        .map(|t| Uuid::parse_str(t))
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(AnalysisJob {
        id: JobId::new(id),
        owner_id: required("owner_id")?.clone(),
        input: serde_json::from_str(required("input")?)?,
        meal_type: required("meal_type")?.clone(),
        status,
        result: fields.get("result").map(|r| serde_json::from_str(r)).transpose()?,
        error: fields.get("error").cloned(),
        retry_count: number("retry_count")?,
        priority: number("priority")?,
        progress: fields.get("progress").map(|p| serde_json::from_str(p)).transpose()?,
        claim_token,
        created_at: time(required("created_at")?.as_str())?,
        started_at: opt_time("started_at")?,
        completed_at: opt_time("completed_at")?,
        expires_at: time(required("expires_at")?.as_str())?,
        available_at: time(required("available_at")?.as_str())?,
        lease_expires_at: opt_time("lease_expires_at")?,
        updated_at: time(required("updated_at")?.as_str())?,
        resubmitted_at: opt_time("resubmitted_at")?,
    })
}
