//! Durable at-least-once job queue and the worker pool that drains it.

pub mod memory;
pub mod redis_queue;
pub mod retry;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;
pub use retry::Backoff;
pub use worker::Worker;

/// Queue messages. Wire shape is `{"name": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum JobMessage {
    #[serde(rename_all = "camelCase")]
    ProcessOrder {
        shopee_order_id: String,
        shop_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PollShop { shop_id: String },
    #[serde(rename_all = "camelCase")]
    ToggleAutoShipping { shop_id: String, active: bool },
    #[serde(rename_all = "camelCase")]
    VerifyCredentials { shop_id: String },
    #[serde(rename_all = "camelCase")]
    ScrapePreview { product_url: String },
}

impl JobMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessOrder { .. } => "process-order",
            Self::PollShop { .. } => "poll-shop",
            Self::ToggleAutoShipping { .. } => "toggle-auto-shipping",
            Self::VerifyCredentials { .. } => "verify-credentials",
            Self::ScrapePreview { .. } => "scrape-preview",
        }
    }

    pub fn shop_id(&self) -> Option<&str> {
        match self {
            Self::ProcessOrder { shop_id, .. }
            | Self::PollShop { shop_id }
            | Self::ToggleAutoShipping { shop_id, .. }
            | Self::VerifyCredentials { shop_id } => Some(shop_id),
            Self::ScrapePreview { .. } => None,
        }
    }
}

/// Repeat key of a shop's polling timer. One key, one timer.
pub fn poll_repeat_key(shop_id: &str) -> String {
    format!("poll-shop:{shop_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub message: JobMessage,
    pub attempts_made: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub repeat_key: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    pub fn new(message: JobMessage, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            repeat_key: None,
            last_error: None,
            enqueued_at: Utc::now(),
            failed_at: None,
        }
    }

    pub fn from_repeat(spec: &RepeatSpec, max_attempts: u32) -> Self {
        Self {
            repeat_key: Some(spec.key.clone()),
            ..Self::new(spec.message.clone(), max_attempts)
        }
    }
}

/// A recurring registration: `message` is enqueued every `every_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepeatSpec {
    pub key: String,
    pub message: JobMessage,
    pub every_ms: u64,
    pub next_run_at: DateTime<Utc>,
}

impl RepeatSpec {
    pub fn new(key: impl Into<String>, message: JobMessage, every: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            message,
            every_ms: every.as_millis() as u64,
            next_run_at: now,
        }
    }

    pub fn advance(&mut self, now: DateTime<Utc>) {
        let step = chrono::Duration::milliseconds(self.every_ms.max(1) as i64);
        while self.next_run_at <= now {
            self.next_run_at += step;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Exhausted,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("corrupt job payload: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: JobMessage) -> Result<Uuid, QueueError>;

    /// Moves the next waiting job into the active set, waiting up to `wait`.
    async fn claim(&self, wait: Duration) -> Result<Option<JobEnvelope>, QueueError>;

    /// Successful jobs are removed outright.
    async fn complete(&self, envelope: &JobEnvelope) -> Result<(), QueueError>;

    /// Schedules a retry with backoff, or retains the job in the failed set
    /// once its attempts are spent.
    async fn fail(&self, envelope: &JobEnvelope, error: &str) -> Result<FailOutcome, QueueError>;

    /// Registers `key` unless it already exists. Returns whether it was new.
    async fn upsert_repeatable(
        &self,
        key: &str,
        message: JobMessage,
        every: Duration,
    ) -> Result<bool, QueueError>;

    async fn repeatables(&self) -> Result<Vec<RepeatSpec>, QueueError>;

    async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError>;

    /// Moves due delayed jobs to waiting and fires due repeatables. A
    /// repeatable whose previous run is still pending is not fired again.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    async fn failed(&self, limit: usize) -> Result<Vec<JobEnvelope>, QueueError>;

    /// Puts jobs left active by a dead process back in line. Every active
    /// job counts as stalled, so this runs once at startup and only while no
    /// other worker shares the backlog.
    async fn recover_stalled(&self) -> Result<usize, QueueError>;
}
