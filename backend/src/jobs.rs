use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_INDEX_DOCUMENT: &str = "index-document";
pub const JOB_REMOVE_FROM_INDEX: &str = "remove-from-index";
pub const JOB_UPDATE_CONTENT_AND_REINDEX: &str = "update-content-and-reindex";

pub const ALL_JOB_TYPES: &[&str] = &[
    JOB_INDEX_DOCUMENT,
    JOB_REMOVE_FROM_INDEX,
    JOB_UPDATE_CONTENT_AND_REINDEX,
];

pub const MAX_ATTEMPTS: i32 = 3;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const KEEP_SUCCEEDED_JOBS: i64 = 1000;
pub const KEEP_FAILED_JOBS: i64 = 5000;
/// A `processing` row untouched for this long lost its worker.
pub const PROCESSING_LEASE: Duration = Duration::from_secs(600);

const INTERRUPTED_ERROR: &str = "worker stopped while the job was processing";

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentJobPayload {
    pub document_id: Uuid,
}

/// Every job the indexing worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexJob {
    IndexDocument { document_id: Uuid },
    RemoveFromIndex { document_id: Uuid },
    UpdateContentAndReindex { document_id: Uuid },
}

impl IndexJob {
    pub fn job_type(&self) -> &'static str {
        match self {
            IndexJob::IndexDocument { .. } => JOB_INDEX_DOCUMENT,
            IndexJob::RemoveFromIndex { .. } => JOB_REMOVE_FROM_INDEX,
            IndexJob::UpdateContentAndReindex { .. } => JOB_UPDATE_CONTENT_AND_REINDEX,
        }
    }

    pub fn document_id(&self) -> Uuid {
        match self {
            IndexJob::IndexDocument { document_id }
            | IndexJob::RemoveFromIndex { document_id }
            | IndexJob::UpdateContentAndReindex { document_id } => *document_id,
        }
    }

    pub fn payload(&self) -> Value {
        json!(DocumentJobPayload {
            document_id: self.document_id()
        })
    }

    pub fn parse(job_type: &str, payload: &Value) -> Result<Self, String> {
        let DocumentJobPayload { document_id } = serde_json::from_value(payload.clone())
            .map_err(|err| format!("invalid {job_type} payload: {err}"))?;
        match job_type {
            JOB_INDEX_DOCUMENT => Ok(IndexJob::IndexDocument { document_id }),
            JOB_REMOVE_FROM_INDEX => Ok(IndexJob::RemoveFromIndex { document_id }),
            JOB_UPDATE_CONTENT_AND_REINDEX => Ok(IndexJob::UpdateContentAndReindex { document_id }),
            other => Err(format!("unknown job type '{other}'")),
        }
    }
}

pub fn enqueue(conn: &mut PgConnection, job: IndexJob) -> JobQueueResult<Job> {
    enqueue_job(conn, job.job_type(), job.payload(), None)
}

pub fn enqueue_job(
    conn: &mut PgConnection,
    job_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> JobQueueResult<Job> {
    let new_job = NewJob {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    };

    let job = diesel::insert_into(jobs::table)
        .values(&new_job)
        .get_result(conn)?;
    Ok(job)
}

pub fn reserve_job(conn: &mut PgConnection, job_types: &[&str]) -> JobQueueResult<Option<Job>> {
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        let job_opt = jobs::table
            .filter(jobs::status.eq(STATUS_QUEUED))
            .filter(jobs::run_after.le(now))
            .filter(jobs::job_type.eq_any(job_types))
            .order(jobs::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Job>(conn)
            .optional()?;

        match job_opt {
            Some(job) => {
                let reserved = diesel::update(jobs::table.find(job.id))
                    .set((
                        jobs::status.eq(STATUS_PROCESSING),
                        jobs::attempts.eq(job.attempts + 1),
                        jobs::updated_at.eq(now),
                    ))
                    .get_result::<Job>(conn)?;
                Ok::<Option<Job>, diesel::result::Error>(Some(reserved))
            }
            None => Ok(None),
        }
    })
    .map_err(JobQueueError::from)
}

/// Puts jobs whose worker stopped mid-run back in the queue, counting the
/// interrupted run as an attempt. Jobs with no attempts left are failed.
pub fn reclaim_stale_jobs(conn: &mut PgConnection, lease: Duration) -> JobQueueResult<usize> {
    let now = Utc::now().naive_utc();
    let cutoff =
        now - ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::minutes(10));

    conn.transaction(|conn| {
        let failed = diesel::update(
            jobs::table
                .filter(jobs::status.eq(STATUS_PROCESSING))
                .filter(jobs::updated_at.lt(cutoff))
                .filter(jobs::attempts.ge(MAX_ATTEMPTS)),
        )
            .set((
                jobs::status.eq(STATUS_FAILED),
                jobs::last_error.eq(Some(INTERRUPTED_ERROR)),
                jobs::updated_at.eq(now),
            ))
            .execute(conn)?;
        let requeued = diesel::update(
            jobs::table
                .filter(jobs::status.eq(STATUS_PROCESSING))
                .filter(jobs::updated_at.lt(cutoff))
                .filter(jobs::attempts.lt(MAX_ATTEMPTS)),
        )
            .set((
                jobs::status.eq(STATUS_QUEUED),
                jobs::run_after.eq(now),
                jobs::last_error.eq(Some(INTERRUPTED_ERROR)),
                jobs::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok::<usize, diesel::result::Error>(failed + requeued)
    })
    .map_err(JobQueueError::from)
}

pub fn mark_job_succeeded(conn: &mut PgConnection, job_id: Uuid) -> JobQueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_SUCCEEDED),
            jobs::last_error.eq::<Option<String>>(None),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Delay before attempt `attempts + 1`: 1s, 2s, 4s, ...
pub fn backoff_delay(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    INITIAL_BACKOFF * 2u32.pow(exponent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued { delay: Duration },
    Exhausted,
}

/// Requeues with exponential backoff, or parks the job in the failed set once
/// `MAX_ATTEMPTS` have been used.
pub fn retry_or_fail(
    conn: &mut PgConnection,
    job: &Job,
    error_message: &str,
) -> JobQueueResult<RetryOutcome> {
    if job.attempts >= MAX_ATTEMPTS {
        mark_job_failed(conn, job.id, error_message)?;
        return Ok(RetryOutcome::Exhausted);
    }

    let delay = backoff_delay(job.attempts);
    retry_job_after(conn, job.id, delay, error_message)?;
    Ok(RetryOutcome::Requeued { delay })
}

pub fn retry_job_after(
    conn: &mut PgConnection,
    job_id: Uuid,
    delay: Duration,
    error_message: &str,
) -> JobQueueResult<()> {
    let next_run = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_QUEUED),
            jobs::run_after.eq(next_run.naive_utc()),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_job_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    error_message: &str,
) -> JobQueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Trims terminal history to the newest `keep` rows of `status`.
pub fn prune_status(conn: &mut PgConnection, status: &str, keep: i64) -> JobQueueResult<usize> {
    let removed = diesel::sql_query(
        "DELETE FROM jobs WHERE status = $1 AND id NOT IN (\
             SELECT id FROM jobs WHERE status = $1 ORDER BY updated_at DESC LIMIT $2\
         )",
    )
    .bind::<Text, _>(status)
    .bind::<BigInt, _>(keep)
    .execute(conn)?;
    Ok(removed)
}

pub fn prune_jobs(conn: &mut PgConnection) -> JobQueueResult<usize> {
    let succeeded = prune_status(conn, STATUS_SUCCEEDED, KEEP_SUCCEEDED_JOBS)?;
    let failed = prune_status(conn, STATUS_FAILED, KEEP_FAILED_JOBS)?;
    Ok(succeeded + failed)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub failed: i64,
}

pub fn queue_stats(conn: &mut PgConnection) -> JobQueueResult<QueueStats> {
    let rows: Vec<(String, i64)> = jobs::table
        .group_by(jobs::status)
        .select((jobs::status, count_star()))
        .load(conn)?;

    let mut stats = QueueStats::default();
    for (status, count) in rows {
        match status.as_str() {
            STATUS_QUEUED => stats.queued = count,
            STATUS_PROCESSING => stats.processing = count,
            STATUS_SUCCEEDED => stats.succeeded = count,
            STATUS_FAILED => stats.failed = count,
            _ => {}
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_one_second_and_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn parses_every_job_kind() {
        let document_id = Uuid::new_v4();
        for job in [
            IndexJob::IndexDocument { document_id },
            IndexJob::RemoveFromIndex { document_id },
            IndexJob::UpdateContentAndReindex { document_id },
        ] {
            let parsed = IndexJob::parse(job.job_type(), &job.payload()).unwrap();
            assert_eq!(parsed, job);
        }
    }

    #[test]
    fn payload_uses_camel_case_document_id() {
        let document_id = Uuid::new_v4();
        let payload = IndexJob::IndexDocument { document_id }.payload();
        assert_eq!(payload, json!({ "documentId": document_id }));
    }

    #[test]
    fn rejects_unknown_job_type_and_bad_payload() {
        let payload = json!({ "documentId": Uuid::new_v4() });
        assert!(IndexJob::parse("send-digest", &payload)
            .unwrap_err()
            .contains("unknown job type"));
        assert!(IndexJob::parse(JOB_INDEX_DOCUMENT, &json!({ "id": 1 })).is_err());
    }
}
