use super::{JobStore, StatusUpdate, TransitionOutcome};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobStatus, Progress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::Connection, AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Priority is folded into the ready-set score as
/// `(511 - priority) * BAND + created_at_ms`, so ZRANGE's lowest score is
/// the highest-priority, oldest job. With |priority| <= 511 and millisecond
/// timestamps below 2^41, the score stays exactly representable in an f64.
const PRIORITY_BAND: i64 = 1 << 42;
const PRIORITY_CLAMP: i64 = 511;

fn ready_score(priority: i32, created_at: DateTime<Utc>) -> f64 {
    let band = PRIORITY_CLAMP - (priority as i64).clamp(-PRIORITY_CLAMP, PRIORITY_CLAMP);
    (band * PRIORITY_BAND + created_at.timestamp_millis()) as f64
}

/// Redis-backed job store.
///
/// Layout per `(queue, kind)`: a `ready` ZSET ordered by the composite
/// score above, a `sched` ZSET of delayed jobs scored by eligibility time,
/// and a `leases` ZSET of active jobs scored by lease expiry. Job records
/// live as JSON strings under `{ns}:job:{id}`; per-queue status counts are
/// kept in a hash. Claiming, sweeping, and conditional transitions each
/// run as one Lua script, which is what makes the claim atomic across
/// processes.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    namespace: String,
    claim_script: Script,
    transition_script: Script,
    progress_script: Script,
}

// Atomic sweep + promote + claim.
//
// KEYS: 1 ready, 2 sched, 3 leases, 4 counts, 5 stalled-counter, 6 order
// ARGV: 1 now_ms, 2 job key prefix, 3 lease token, 4 lease_expires rfc3339,
//       5 lease_expires_ms, 6 now rfc3339
const CLAIM_LUA: &str = r#"
local now = tonumber(ARGV[1])

-- promote scheduled jobs whose delay elapsed
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local raw = redis.call('GET', ARGV[2] .. id)
    if raw then
        local job = cjson.decode(raw)
        job['status'] = 'waiting'
        job['delay_until'] = cjson.null
        redis.call('SET', ARGV[2] .. id, cjson.encode(job))
        redis.call('HINCRBY', KEYS[4], 'delayed', -1)
        redis.call('HINCRBY', KEYS[4], 'waiting', 1)
        local score = redis.call('HGET', KEYS[6], id)
        redis.call('ZADD', KEYS[1], tonumber(score), id)
    end
end

-- reclaim lapsed leases: the attempt was charged at claim time, so the
-- job is either immediately claimable again or out of attempts
local lapsed = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(lapsed) do
    redis.call('ZREM', KEYS[3], id)
    local raw = redis.call('GET', ARGV[2] .. id)
    if raw then
        local job = cjson.decode(raw)
        redis.call('INCR', KEYS[5])
        job['lease_token'] = cjson.null
        job['lease_expires_at'] = cjson.null
        job['error'] = 'lease expired on attempt ' .. job['attempts']
        if job['attempts'] >= job['max_attempts'] then
            job['status'] = 'failed'
            job['finished_at'] = ARGV[6]
            redis.call('HINCRBY', KEYS[4], 'active', -1)
            redis.call('HINCRBY', KEYS[4], 'failed', 1)
            redis.call('HDEL', KEYS[6], id)
        else
            job['status'] = 'waiting'
            job['delay_until'] = cjson.null
            redis.call('HINCRBY', KEYS[4], 'active', -1)
            redis.call('HINCRBY', KEYS[4], 'waiting', 1)
            local score = redis.call('HGET', KEYS[6], id)
            redis.call('ZADD', KEYS[1], tonumber(score), id)
        end
        redis.call('SET', ARGV[2] .. id, cjson.encode(job))
    end
end

-- claim the best ready job
local best = redis.call('ZRANGE', KEYS[1], 0, 0)
if #best == 0 then
    return nil
end
local id = best[1]
redis.call('ZREM', KEYS[1], id)
local raw = redis.call('GET', ARGV[2] .. id)
if not raw then
    return nil
end
local job = cjson.decode(raw)
job['status'] = 'active'
job['attempts'] = job['attempts'] + 1
job['progress'] = cjson.null
job['processed_at'] = ARGV[6]
job['lease_token'] = ARGV[3]
job['lease_expires_at'] = ARGV[4]
local encoded = cjson.encode(job)
redis.call('SET', ARGV[2] .. id, encoded)
redis.call('ZADD', KEYS[3], tonumber(ARGV[5]), id)
redis.call('HINCRBY', KEYS[4], 'waiting', -1)
redis.call('HINCRBY', KEYS[4], 'active', 1)
return encoded
"#;

// Conditional transition guarded by lease token + expected status.
//
// KEYS: 1 job, 2 counts, 3 leases, 4 sched, 5 order
// ARGV: 1 lease token, 2 expected, 3 new, 4 fields json,
//       5 delay_until_ms ('' when absent), 6 job id
const TRANSITION_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local job = cjson.decode(raw)
if job['status'] ~= ARGV[2] or job['lease_token'] ~= ARGV[1] then
    return 0
end
local fields = cjson.decode(ARGV[4])
job['status'] = ARGV[3]
if fields['result'] ~= cjson.null then job['result'] = fields['result'] end
if fields['error'] ~= cjson.null then job['error'] = fields['error'] end
job['delay_until'] = fields['delay_until']
if fields['finished_at'] ~= cjson.null then job['finished_at'] = fields['finished_at'] end
if ARGV[3] ~= 'active' then
    job['lease_token'] = cjson.null
    job['lease_expires_at'] = cjson.null
    redis.call('ZREM', KEYS[3], ARGV[6])
end
if ARGV[3] == 'delayed' and ARGV[5] ~= '' then
    redis.call('ZADD', KEYS[4], tonumber(ARGV[5]), ARGV[6])
end
if ARGV[3] == 'completed' or ARGV[3] == 'failed' then
    redis.call('HDEL', KEYS[5], ARGV[6])
end
redis.call('SET', KEYS[1], cjson.encode(job))
redis.call('HINCRBY', KEYS[2], ARGV[2], -1)
redis.call('HINCRBY', KEYS[2], ARGV[3], 1)
return 1
"#;

// Lease-checked, monotonic progress write.
//
// KEYS: 1 job
// ARGV: 1 lease token, 2 percentage, 3 message
const PROGRESS_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local job = cjson.decode(raw)
if job['status'] ~= 'active' or job['lease_token'] ~= ARGV[1] then
    return 0
end
local pct = tonumber(ARGV[2])
if job['progress'] ~= cjson.null and type(job['progress']) == 'table' then
    if pct < job['progress']['percentage'] then
        return 0
    end
end
job['progress'] = { percentage = pct, message = ARGV[3] }
redis.call('SET', KEYS[1], cjson.encode(job))
return 1
"#;

impl RedisStore {
    pub fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| QueueError::Config(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            claim_script: Script::new(CLAIM_LUA),
            transition_script: Script::new(TRANSITION_LUA),
            progress_script: Script::new(PROGRESS_LUA),
        })
    }

    async fn conn(&self) -> Result<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| QueueError::Store(e.to_string()))
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    fn ready_key(&self, queue: &str, kind: &str) -> String {
        format!("{}:{}:{}:ready", self.namespace, queue, kind)
    }

    fn sched_key(&self, queue: &str, kind: &str) -> String {
        format!("{}:{}:{}:sched", self.namespace, queue, kind)
    }

    fn leases_key(&self, queue: &str, kind: &str) -> String {
        format!("{}:{}:{}:leases", self.namespace, queue, kind)
    }

    fn order_key(&self, queue: &str, kind: &str) -> String {
        format!("{}:{}:{}:order", self.namespace, queue, kind)
    }

    fn counts_key(&self, queue: &str) -> String {
        format!("{}:{}:counts", self.namespace, queue)
    }

    fn stalled_key(&self, queue: &str) -> String {
        format!("{}:{}:stalled", self.namespace, queue)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(&job)?;
        let score = ready_score(job.priority, job.created_at);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.job_key(job.id), encoded)
            .hset(
                self.order_key(&job.queue, &job.kind),
                job.id.to_string(),
                score,
            )
            .hincr(self.counts_key(&job.queue), job.status.as_str(), 1i64);
        match (job.status, job.delay_until) {
            (JobStatus::Delayed, Some(at)) => {
                pipe.zadd(
                    self.sched_key(&job.queue, &job.kind),
                    job.id.to_string(),
                    at.timestamp_millis() as f64,
                );
            }
            _ => {
                pipe.zadd(
                    self.ready_key(&job.queue, &job.kind),
                    job.id.to_string(),
                    score,
                );
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;
        Ok(())
    }

    async fn claim_next(
        &self,
        queue: &str,
        kind: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| QueueError::Store(e.to_string()))?;

        let raw: Option<String> = self
            .claim_script
            .key(self.ready_key(queue, kind))
            .key(self.sched_key(queue, kind))
            .key(self.leases_key(queue, kind))
            .key(self.counts_key(queue))
            .key(self.stalled_key(queue))
            .key(self.order_key(queue, kind))
            .arg(now.timestamp_millis())
            .arg(self.job_prefix())
            .arg(Uuid::new_v4().to_string())
            .arg(expires.to_rfc3339())
            .arg(expires.timestamp_millis())
            .arg(now.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: JobId,
        lease: Uuid,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<TransitionOutcome> {
        let job = match self.get(id).await? {
            Some(job) => job,
            None => return Ok(TransitionOutcome::Conflict),
        };
        let mut conn = self.conn().await?;
        let delay_ms = fields
            .delay_until
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();

        let applied: i64 = self
            .transition_script
            .key(self.job_key(id))
            .key(self.counts_key(&job.queue))
            .key(self.leases_key(&job.queue, &job.kind))
            .key(self.sched_key(&job.queue, &job.kind))
            .key(self.order_key(&job.queue, &job.kind))
            .arg(lease.to_string())
            .arg(expected.as_str())
            .arg(new.as_str())
            .arg(serde_json::to_string(&fields)?)
            .arg(delay_ms)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        if applied == 1 {
            Ok(TransitionOutcome::Applied)
        } else {
            Ok(TransitionOutcome::Conflict)
        }
    }

    async fn write_progress(&self, id: JobId, lease: Uuid, progress: Progress) -> Result<bool> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .progress_script
            .key(self.job_key(id))
            .arg(lease.to_string())
            .arg(progress.percentage as i64)
            .arg(progress.message)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;
        Ok(applied == 1)
    }

    async fn count_by_status(&self, queue: &str) -> Result<HashMap<JobStatus, u64>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, i64> = conn
            .hgetall(self.counts_key(queue))
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;

        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for status in JobStatus::ALL {
            if let Some(n) = raw.get(status.as_str()) {
                counts.insert(status, (*n).max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(self.job_key(id))
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn stalled_total(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let n: Option<u64> = conn
            .get(self.stalled_key(queue))
            .await
            .map_err(|e| QueueError::Store(e.to_string()))?;
        Ok(n.unwrap_or(0))
    }
}
