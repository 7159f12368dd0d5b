use crate::jobs::{
    Backoff, FailOutcome, JobEnvelope, JobMessage, JobQueue, QueueError, RepeatSpec,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Direction, Script, aio::MultiplexedConnection};
use std::{collections::HashMap, time::Duration};
use tracing::warn;
use uuid::Uuid;

const PREFIX: &str = "dropship:queue";
const CLAIM_POLL: Duration = Duration::from_millis(200);

// Rewrites a repeat spec only if it still holds the value the promoter read.
// A spec removed (or advanced by another promoter) in between is left alone.
const ADVANCE_REPEAT: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
";

/// Key layout. Job bodies live in one hash; the lists and sorted set hold ids.
#[derive(Debug, Clone)]
struct Keys {
    jobs: String,
    waiting: String,
    active: String,
    delayed: String,
    failed: String,
    repeat: String,
    pending_repeat: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{prefix}:jobs"),
            waiting: format!("{prefix}:waiting"),
            active: format!("{prefix}:active"),
            delayed: format!("{prefix}:delayed"),
            failed: format!("{prefix}:failed"),
            repeat: format!("{prefix}:repeat"),
            pending_repeat: format!("{prefix}:pending-repeat"),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, QueueError> {
    serde_json::to_string(value).map_err(|err| QueueError::Corrupt(err.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, QueueError> {
    serde_json::from_str(raw).map_err(|err| QueueError::Corrupt(err.to_string()))
}

fn due_score(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

/// Queue state in Redis so jobs survive restarts. One worker process owns a
/// backlog: `recover_stalled` treats every active job as orphaned.
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    keys: Keys,
    backoff: Backoff,
}

impl RedisQueue {
    pub async fn connect(url: &str, backoff: Backoff) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            keys: Keys::new(PREFIX),
            backoff,
        })
    }

    async fn store_job(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = encode(envelope)?;
        let _: () = conn
            .hset(&self.keys.jobs, envelope.id.to_string(), body)
            .await?;
        Ok(())
    }

    async fn push_waiting(&self, id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&self.keys.waiting, id.to_string()).await?;
        Ok(())
    }

    async fn push_delayed(&self, id: Uuid, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(&self.keys.delayed, id.to_string(), due_score(delay))
            .await?;
        Ok(())
    }

    async fn advance_if_unchanged(&self, key: &str, seen: &str, next: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let written: i64 = Script::new(ADVANCE_REPEAT)
            .key(&self.keys.repeat)
            .arg(key)
            .arg(seen)
            .arg(next)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn load(&self, id: &str) -> Result<Option<JobEnvelope>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(&self.keys.jobs, id).await?;
        raw.as_deref().map(decode).transpose()
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<Uuid, QueueError> {
        let envelope = JobEnvelope::new(message, self.backoff.max_attempts);
        self.store_job(&envelope).await?;
        self.push_waiting(envelope.id).await?;
        Ok(envelope.id)
    }

    // LMOVE keeps the id in `active` until complete/fail, so a crash leaves it
    // recoverable.
    async fn claim(&self, wait: Duration) -> Result<Option<JobEnvelope>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.conn.clone();
        loop {
            let id: Option<String> = conn
                .lmove(&self.keys.waiting, &self.keys.active, Direction::Left, Direction::Right)
                .await?;
            if let Some(id) = id {
                match self.load(&id).await? {
                    Some(envelope) => return Ok(Some(envelope)),
                    None => {
                        warn!(target = "dropship.queue", job_id = %id, "job_body_missing");
                        let _: () = conn.lrem(&self.keys.active, 1, &id).await?;
                        continue;
                    }
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let id = envelope.id.to_string();
        let _: () = conn.lrem(&self.keys.active, 1, &id).await?;
        let _: () = conn.hdel(&self.keys.jobs, &id).await?;
        if let Some(key) = &envelope.repeat_key {
            let _: () = conn.srem(&self.keys.pending_repeat, key).await?;
        }
        Ok(())
    }

    async fn fail(&self, envelope: &JobEnvelope, error: &str) -> Result<FailOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let id = envelope.id.to_string();
        let _: () = conn.lrem(&self.keys.active, 1, &id).await?;

        let mut next = envelope.clone();
        next.attempts_made += 1;
        next.last_error = Some(error.to_string());
        match self.backoff.delay_after(next.attempts_made, next.max_attempts) {
            Some(delay) => {
                self.store_job(&next).await?;
                self.push_delayed(next.id, delay).await?;
                Ok(FailOutcome::Retrying { delay })
            }
            None => {
                next.failed_at = Some(Utc::now());
                self.store_job(&next).await?;
                let _: () = conn.lpush(&self.keys.failed, &id).await?;
                if let Some(key) = &next.repeat_key {
                    let _: () = conn.srem(&self.keys.pending_repeat, key).await?;
                }
                Ok(FailOutcome::Exhausted)
            }
        }
    }

    async fn upsert_repeatable(
        &self,
        key: &str,
        message: JobMessage,
        every: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let spec = RepeatSpec::new(key, message, every, Utc::now());
        let created: bool = conn.hset_nx(&self.keys.repeat, key, encode(&spec)?).await?;
        Ok(created)
    }

    async fn repeatables(&self) -> Result<Vec<RepeatSpec>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(&self.keys.repeat).await?;
        raw.iter().map(|spec| decode(spec)).collect()
    }

    async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(&self.keys.repeat, key).await?;
        Ok(removed > 0)
    }

    // ZREM, the advance script and SADD each settle a race with a concurrent promoter.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut promoted = 0;

        let due: Vec<String> = conn
            .zrangebyscore(&self.keys.delayed, "-inf", now.timestamp_millis())
            .await?;
        for id in due {
            let removed: i64 = conn.zrem(&self.keys.delayed, &id).await?;
            if removed == 1 {
                let _: () = conn.rpush(&self.keys.waiting, &id).await?;
                promoted += 1;
            }
        }

        let specs: HashMap<String, String> = conn.hgetall(&self.keys.repeat).await?;
        for (key, raw) in specs {
            let Some(spec) = advance_due(&raw, now)? else {
                continue;
            };
            if !self.advance_if_unchanged(&key, &raw, &encode(&spec)?).await? {
                continue;
            }
            let fresh: bool = conn.sadd(&self.keys.pending_repeat, &spec.key).await?;
            if fresh {
                let envelope = JobEnvelope::from_repeat(&spec, self.backoff.max_attempts);
                self.store_job(&envelope).await?;
                self.push_waiting(envelope.id).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn failed(&self, limit: usize) -> Result<Vec<JobEnvelope>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(&self.keys.failed, 0, limit as isize - 1)
            .await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(envelope) = self.load(&id).await? {
                jobs.push(envelope);
            }
        }
        Ok(jobs)
    }

    async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let id: Option<String> = conn
                .lmove(&self.keys.active, &self.keys.waiting, Direction::Right, Direction::Left)
                .await?;
            if id.is_none() {
                return Ok(recovered);
            }
            recovered += 1;
        }
    }
}

/// The advanced spec when `raw` is due at `now`.
fn advance_due(raw: &str, now: DateTime<Utc>) -> Result<Option<RepeatSpec>, QueueError> {
    let mut spec: RepeatSpec = decode(raw)?;
    if spec.next_run_at > now {
        return Ok(None);
    }
    spec.advance(now);
    Ok(Some(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_one_prefix() {
        let keys = Keys::new(PREFIX);
        assert_eq!(keys.jobs, "dropship:queue:jobs");
        assert_eq!(keys.pending_repeat, "dropship:queue:pending-repeat");
        for key in [&keys.waiting, &keys.active, &keys.delayed, &keys.failed, &keys.repeat] {
            assert!(key.starts_with("dropship:queue:"));
        }
    }

    #[test]
    fn stored_envelope_survives_encoding() {
        let mut envelope = JobEnvelope::new(
            JobMessage::PollShop {
                shop_id: "shop-1".into(),
            },
            3,
        );
        envelope.repeat_key = Some("poll-shop:shop-1".into());
        let decoded: JobEnvelope = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(matches!(
            decode::<JobEnvelope>("{\"id\":1}"),
            Err(QueueError::Corrupt(_))
        ));
    }

    #[test]
    fn only_due_specs_advance() {
        let now = Utc::now();
        let spec = RepeatSpec::new(
            "poll-shop:shop-1",
            JobMessage::PollShop {
                shop_id: "shop-1".into(),
            },
            Duration::from_secs(60),
            now,
        );
        let raw = encode(&spec).unwrap();
        let advanced = advance_due(&raw, now).unwrap().unwrap();
        assert!(advanced.next_run_at > now);
        assert!(advance_due(&encode(&advanced).unwrap(), now).unwrap().is_none());
    }

    // Needs a live server; set REDIS_TEST_URL to run it.
    #[tokio::test]
    async fn removed_repeatable_is_not_rewritten_by_a_stale_promoter() {
        let Ok(url) = std::env::var("REDIS_TEST_URL") else {
            return;
        };
        let mut queue = RedisQueue::connect(&url, Backoff::default()).await.unwrap();
        queue.keys = Keys::new(&format!("dropship:test:{}", Uuid::new_v4()));
        let key = "poll-shop:shop-1";
        let message = JobMessage::PollShop {
            shop_id: "shop-1".into(),
        };
        let every = Duration::from_secs(60);
        let mut conn = queue.conn.clone();

        queue.upsert_repeatable(key, message.clone(), every).await.unwrap();
        let seen: String = conn.hget(&queue.keys.repeat, key).await.unwrap();
        let next = encode(&advance_due(&seen, Utc::now()).unwrap().unwrap()).unwrap();

        // Toggled off between the read and the write.
        queue.remove_repeatable(key).await.unwrap();
        assert!(!queue.advance_if_unchanged(key, &seen, &next).await.unwrap());
        assert!(queue.repeatables().await.unwrap().is_empty());

        queue.upsert_repeatable(key, message, every).await.unwrap();
        let seen: String = conn.hget(&queue.keys.repeat, key).await.unwrap();
        assert!(queue.advance_if_unchanged(key, &seen, &next).await.unwrap());
        // A second promoter holding the same read loses.
        assert!(!queue.advance_if_unchanged(key, &seen, &next).await.unwrap());
        queue.remove_repeatable(key).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_a_backend_error() {
        let err = RedisQueue::connect("redis://127.0.0.1:9/", Backoff::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Backend(_)));
    }
}
