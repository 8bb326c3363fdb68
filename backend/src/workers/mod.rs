use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};
use tracing::{error, info, warn};

use crate::{
    jobs::{
        mark_job_failed, mark_job_succeeded, prune_jobs, reclaim_stale_jobs, reserve_job,
        retry_or_fail, IndexJob, JobQueueError, RetryOutcome, ALL_JOB_TYPES, PROCESSING_LEASE,
    },
    models::Job,
    state::AppState,
};

pub mod index;

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub enum JobExecution {
    Success,
    Retry { error: String },
    Failed { error: String },
}

/// Runs one indexing job to completion.
pub async fn dispatch(state: &AppState, job: IndexJob) -> JobExecution {
    match job {
        IndexJob::IndexDocument { document_id } => index::index_document(state, document_id).await,
        IndexJob::RemoveFromIndex { document_id } => {
            index::remove_from_index(state, document_id).await
        }
        IndexJob::UpdateContentAndReindex { document_id } => {
            index::update_content_and_reindex(state, document_id).await
        }
    }
}

pub struct Worker {
    state: Arc<AppState>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(state: Arc<AppState>, poll_interval: Duration) -> Self {
        Self {
            state,
            poll_interval,
        }
    }

    /// Starts `concurrency` polling loops; each holds at most one job.
    pub fn spawn(self: Arc<Self>, concurrency: usize) -> WorkerPool {
        let (stop, stop_rx) = watch::channel(false);
        let handles = (0..concurrency.max(1))
            .map(|slot| {
                let worker = self.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(async move { worker.run(slot, stop_rx).await })
            })
            .collect();
        WorkerPool { handles, stop }
    }

    /// Polls until `stop` flips. A job already running is finished first.
    pub async fn run(&self, slot: usize, mut stop: watch::Receiver<bool>) {
        info!(slot, "index worker started");
        if slot == 0 {
            self.maintain();
        }
        let mut since_maintenance = Duration::ZERO;
        while !*stop.borrow() {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => {
                    if wait_or_stop(self.poll_interval, &mut stop).await {
                        break;
                    }
                    since_maintenance += self.poll_interval;
                    if slot == 0 && since_maintenance >= PRUNE_INTERVAL {
                        since_maintenance = Duration::ZERO;
                        self.maintain();
                    }
                }
                Err(err) => {
                    error!(slot, error = %err, "worker tick failed");
                    if wait_or_stop(self.poll_interval, &mut stop).await {
                        break;
                    }
                }
            }
        }
        info!(slot, "index worker stopped");
    }

    /// Reserves and runs one job. Returns whether a job was found.
    pub async fn tick(&self) -> Result<bool, JobQueueError> {
        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                error!(?err, "failed to obtain database connection in worker");
                return Ok(false);
            }
        };

        let job_opt = reserve_job(&mut conn, ALL_JOB_TYPES)?;
        drop(conn);

        let Some(job) = job_opt else {
            return Ok(false);
        };

        let execution = match IndexJob::parse(&job.job_type, &job.payload) {
            Ok(kind) => dispatch(&self.state, kind).await,
            Err(error) => JobExecution::Failed { error },
        };
        self.finish(&job, execution)?;
        Ok(true)
    }

    fn finish(&self, job: &Job, execution: JobExecution) -> Result<(), JobQueueError> {
        let Ok(mut conn) = self.state.db() else {
            error!(job_id = %job.id, "failed to record job outcome due to pool error");
            return Ok(());
        };

        match execution {
            JobExecution::Success => {
                mark_job_succeeded(&mut conn, job.id)?;
                info!(job_id = %job.id, job_type = %job.job_type, "job completed successfully");
            }
            JobExecution::Retry { error } => match retry_or_fail(&mut conn, job, &error)? {
                RetryOutcome::Requeued { delay } => warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "job will retry"
                ),
                RetryOutcome::Exhausted => error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    %error,
                    "job exhausted its retries"
                ),
            },
            JobExecution::Failed { error } => {
                error!(job_id = %job.id, job_type = %job.job_type, %error, "job failed");
                mark_job_failed(&mut conn, job.id, &error)?;
            }
        }
        Ok(())
    }

    /// Reclaims jobs orphaned by a stopped worker and trims job history.
    fn maintain(&self) {
        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(?err, "failed to obtain connection for queue maintenance");
                return;
            }
        };
        match reclaim_stale_jobs(&mut conn, PROCESSING_LEASE) {
            Ok(0) => {}
            Ok(reclaimed) => warn!(reclaimed, "reclaimed jobs left in processing"),
            Err(err) => warn!(error = %err, "failed to reclaim stale jobs"),
        }
        match prune_jobs(&mut conn) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "pruned job history"),
            Err(err) => warn!(error = %err, "failed to prune job history"),
        }
    }
}

/// Sleeps for `delay` unless a stop is requested first. Returns whether to stop.
async fn wait_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

/// Running worker loops and the switch that stops them.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl WorkerPool {
    /// Asks every loop to stop after its current job and waits up to `grace`.
    /// Loops still busy after that are aborted; their jobs are reclaimed once
    /// `PROCESSING_LEASE` passes.
    pub async fn shutdown(self, grace: Duration) {
        self.stop.send_replace(true);
        let deadline = Instant::now() + grace;
        for mut handle in self.handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("index worker still busy at shutdown; aborting");
                handle.abort();
            }
        }
        info!("index workers drained");
    }
}
