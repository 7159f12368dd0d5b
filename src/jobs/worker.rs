use crate::jobs::{FailOutcome, JobEnvelope, JobMessage, JobQueue};
use crate::metrics;
use crate::pipeline::{JobReport, Pipeline, PipelineError};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

const CLAIM_WAIT: Duration = Duration::from_secs(1);

/// What the worker runs for each claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, message: &JobMessage) -> Result<JobReport, PipelineError>;
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, message: &JobMessage) -> Result<JobReport, PipelineError> {
        Pipeline::handle(self, message).await
    }
}

/// Fixed-size pool draining the queue. Each slot holds one job, and with it
/// at most one browser page, for the job's whole duration.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    tick: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        tick: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
            tick,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Claims until `shutdown` flips, then waits for in-flight jobs. A job
    /// that has started is never cancelled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.queue.recover_stalled().await {
            Ok(0) => {}
            Ok(recovered) => {
                warn!(target = "dropship.worker", recovered, "stalled_jobs_requeued")
            }
            Err(err) => {
                error!(target = "dropship.worker", error = %err, "stalled_job_recovery_failed")
            }
        }

        let promoter = tokio::spawn(promote_loop(self.queue.clone(), self.tick, shutdown.clone()));
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        info!(target = "dropship.worker", concurrency = self.concurrency, "worker_started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!(target = "dropship.worker", error = %err, "job_task_panicked");
                }
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            // Claims are bounded by CLAIM_WAIT, so a claim is never abandoned
            // halfway through.
            match self.queue.claim(CLAIM_WAIT).await {
                Ok(Some(envelope)) => {
                    in_flight.spawn(run_job(
                        self.queue.clone(),
                        self.handler.clone(),
                        envelope,
                        permit,
                    ));
                }
                Ok(None) => {}
                Err(err) => {
                    error!(target = "dropship.worker", error = %err, "claim_failed");
                    tokio::time::sleep(CLAIM_WAIT).await;
                }
            }
        }

        info!(target = "dropship.worker", in_flight = in_flight.len(), "worker_draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(target = "dropship.worker", error = %err, "job_task_panicked");
            }
        }
        promoter.abort();
        info!(target = "dropship.worker", "worker_stopped");
    }
}

async fn promote_loop(queue: Arc<dyn JobQueue>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        match queue.promote_due(Utc::now()).await {
            Ok(0) => {}
            Ok(promoted) => debug!(target = "dropship.queue", promoted, "jobs_promoted"),
            Err(err) => warn!(target = "dropship.queue", error = %err, "promote_failed"),
        }
    }
}

async fn run_job(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    mut envelope: JobEnvelope,
    _permit: OwnedSemaphorePermit,
) {
    let job = envelope.message.name();
    let started = Instant::now();
    info!(
        target = "dropship.queue",
        job_id = %envelope.id,
        job,
        shop_id = envelope.message.shop_id().unwrap_or("-"),
        attempt = envelope.attempts_made + 1,
        "job_started"
    );

    match handle_isolated(handler, &envelope).await {
        Ok(report) => {
            if let Err(err) = queue.complete(&envelope).await {
                error!(target = "dropship.queue", job_id = %envelope.id, error = %err, "job_complete_failed");
            }
            info!(
                target = "dropship.queue",
                job_id = %envelope.id,
                job,
                elapsed_ms = started.elapsed().as_millis() as u64,
                report = ?report,
                "job_completed"
            );
            metrics::job_finished(job, "completed", started.elapsed().as_millis());
        }
        Err(err) => {
            // Configuration failures spend the remaining attempts at once.
            if !err.is_transient() {
                envelope.attempts_made = envelope.max_attempts.saturating_sub(1);
            }
            let message = err.to_string();
            match queue.fail(&envelope, &message).await {
                Ok(FailOutcome::Retrying { delay }) => {
                    warn!(
                        target = "dropship.queue",
                        job_id = %envelope.id,
                        job,
                        stage = err.stage(),
                        error = %err.detail(),
                        delay_ms = delay.as_millis() as u64,
                        "job_retry_scheduled"
                    );
                    metrics::job_finished(job, "retrying", started.elapsed().as_millis());
                }
                Ok(FailOutcome::Exhausted) => {
                    error!(
                        target = "dropship.queue",
                        job_id = %envelope.id,
                        job,
                        stage = err.stage(),
                        error = %err.detail(),
                        "job_failed"
                    );
                    metrics::job_finished(job, "failed", started.elapsed().as_millis());
                }
                Err(queue_err) => {
                    error!(
                        target = "dropship.queue",
                        job_id = %envelope.id,
                        error = %queue_err,
                        "job_fail_record_failed"
                    );
                }
            }
        }
    }
}

/// Runs the handler on its own task so a panic comes back as a failure and
/// the job still goes through `fail` (backoff, repeat bookkeeping) instead
/// of sitting in `active`.
async fn handle_isolated(
    handler: Arc<dyn JobHandler>,
    envelope: &JobEnvelope,
) -> Result<JobReport, PipelineError> {
    let message = envelope.message.clone();
    let task = tokio::spawn(async move { handler.handle(&message).await });
    match task.await {
        Ok(result) => result,
        Err(err) => {
            error!(
                target = "dropship.worker",
                job_id = %envelope.id,
                job = envelope.message.name(),
                error = %err,
                "job_handler_panicked"
            );
            // A panic is a bug, not an outage: retrying would only repeat it.
            Err(PipelineError::configuration(
                "handler",
                format!("job handler panicked: {err}"),
            ))
        }
    }
}
