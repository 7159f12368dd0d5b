use crate::jobs::{
    Backoff, FailOutcome, JobEnvelope, JobMessage, JobQueue, QueueError, RepeatSpec,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
struct State {
    waiting: VecDeque<JobEnvelope>,
    delayed: Vec<(DateTime<Utc>, JobEnvelope)>,
    active: HashMap<Uuid, JobEnvelope>,
    failed: Vec<JobEnvelope>,
    repeat: BTreeMap<String, RepeatSpec>,
    pending_repeat: HashSet<String>,
}

/// Process-local queue with the same contract as the Redis one. Jobs do not
/// survive a restart.
pub struct MemoryQueue {
    state: Mutex<State>,
    ready: Notify,
    backoff: Backoff,
}

impl MemoryQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            backoff,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_waiting(&self, envelope: JobEnvelope) {
        self.state().waiting.push_back(envelope);
        self.ready.notify_one();
    }
}

#[cfg(test)]
impl MemoryQueue {
    pub fn waiting(&self) -> Vec<JobEnvelope> {
        self.state().waiting.iter().cloned().collect()
    }

    pub fn delayed_len(&self) -> usize {
        self.state().delayed.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<Uuid, QueueError> {
        let envelope = JobEnvelope::new(message, self.backoff.max_attempts);
        let id = envelope.id;
        self.push_waiting(envelope);
        Ok(id)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<JobEnvelope>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.state();
                if let Some(envelope) = state.waiting.pop_front() {
                    state.active.insert(envelope.id, envelope.clone());
                    return Ok(Some(envelope));
                }
            }
            if tokio::time::timeout_at(deadline, self.ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut state = self.state();
        state.active.remove(&envelope.id);
        if let Some(key) = &envelope.repeat_key {
            state.pending_repeat.remove(key);
        }
        Ok(())
    }

    async fn fail(&self, envelope: &JobEnvelope, error: &str) -> Result<FailOutcome, QueueError> {
        let mut next = envelope.clone();
        next.attempts_made += 1;
        next.last_error = Some(error.to_string());
        let mut state = self.state();
        state.active.remove(&envelope.id);
        match self.backoff.delay_after(next.attempts_made, next.max_attempts) {
            Some(delay) => {
                let due = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                state.delayed.push((due, next));
                Ok(FailOutcome::Retrying { delay })
            }
            None => {
                if let Some(key) = &next.repeat_key {
                    state.pending_repeat.remove(key);
                }
                next.failed_at = Some(Utc::now());
                state.failed.push(next);
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
        let mut state = self.state();
        if state.repeat.contains_key(key) {
            return Ok(false);
        }
        state
            .repeat
            .insert(key.to_string(), RepeatSpec::new(key, message, every, Utc::now()));
        Ok(true)
    }

    async fn repeatables(&self) -> Result<Vec<RepeatSpec>, QueueError> {
        Ok(self.state().repeat.values().cloned().collect())
    }

    async fn remove_repeatable(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.state().repeat.remove(key).is_some())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut promoted = 0;
        {
            let mut state = self.state();
            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
                .into_iter()
                .partition(|(at, _)| *at <= now);
            state.delayed = later;
            for (_, envelope) in due {
                state.waiting.push_back(envelope);
                promoted += 1;
            }

            let max_attempts = self.backoff.max_attempts;
            let mut fired = Vec::new();
            for spec in state.repeat.values_mut() {
                if spec.next_run_at > now {
                    continue;
                }
                spec.advance(now);
                fired.push(JobEnvelope::from_repeat(spec, max_attempts));
            }
            for envelope in fired {
                let Some(key) = envelope.repeat_key.clone() else {
                    continue;
                };
                if state.pending_repeat.insert(key) {
                    state.waiting.push_back(envelope);
                    promoted += 1;
                }
            }
        }
        for _ in 0..promoted {
            self.ready.notify_one();
        }
        Ok(promoted)
    }

    async fn failed(&self, limit: usize) -> Result<Vec<JobEnvelope>, QueueError> {
        Ok(self.state().failed.iter().rev().take(limit).cloned().collect())
    }

    async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut state = self.state();
        let stalled: Vec<JobEnvelope> = state.active.drain().map(|(_, env)| env).collect();
        let count = stalled.len();
        for envelope in stalled {
            state.waiting.push_front(envelope);
        }
        Ok(count)
    }
}
