//! Durable job queue over PostgreSQL.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so that at most one worker ever
//! holds a job in `processing`. Wake-ups are delivered over LISTEN/NOTIFY
//! as a latency optimization only; the periodic poll is the correctness
//! backstop.

pub mod listener;

use crate::db::models::{JobRow, JobStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
	#[error(transparent)]
	Database(#[from] sqlx::Error),
	#[error("Job {0} not found")]
	NotFound(Uuid),
}

/// A job claimed for processing. `attempts` reflects the claim itself,
/// i.e. it has already been incremented.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedJob {
	pub id: Uuid,
	pub job_type: String,
	pub payload: Value,
	pub priority: i32,
	pub attempts: i32,
	pub max_attempts: i32,
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
	pub priority: i32,
	pub max_attempts: i32,
	pub available_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
	fn default() -> Self {
		Self {
			priority: 0,
			max_attempts: 3,
			available_at: None,
		}
	}
}

/// Outcome of [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
	/// Rescheduled as `pending` with the given backoff delay.
	Retry(Duration),
	/// Retries exhausted; the job is now a dead letter.
	DeadLetter,
}

/// Per-status job counts, sampled by the autoscaler.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepth {
	pub pending: i64,
	pub processing: i64,
	pub completed: i64,
	pub dead_letter: i64,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
	pool: PgPool,
	worker_id: String,
}

impl JobQueue {
	pub fn new(pool: PgPool, worker_id: impl Into<String>) -> Self {
		Self {
			pool,
			worker_id: worker_id.into(),
		}
	}

	pub fn worker_id(&self) -> &str {
		&self.worker_id
	}

	pub const fn pool(&self) -> &PgPool {
		&self.pool
	}

	/// Inserts a new `pending` job and posts a best-effort notification.
	pub async fn enqueue(
		&self,
		job_type: &str,
		payload: &Value,
		options: EnqueueOptions,
	) -> Result<Uuid, QueueError> {
		let id = Uuid::new_v4();
		let available_at = options.available_at.unwrap_or_else(Utc::now);

		sqlx::query(
			"INSERT INTO jobs (id, job_type, payload, status, priority, max_attempts, available_at) \
			 VALUES ($1, $2, $3, 'pending', $4, $5, $6)",
		)
		.bind(id)
		.bind(job_type)
		.bind(payload)
		.bind(options.priority)
		.bind(options.max_attempts)
		.bind(available_at)
		.execute(&self.pool)
		.await?;

		self.notify(job_type).await;

		debug!(job_id = %id, job_type, priority = options.priority, "Enqueued job");
		Ok(id)
	}

	/// Claims up to `batch_size` eligible jobs in a single statement.
	///
	/// Eligible rows (`pending` and available) are ordered by priority
	/// descending then insertion order, locked with SKIP LOCKED, and moved
	/// to `processing` with this worker as the owner.
	pub async fn claim(
		&self,
		job_type: Option<&str>,
		batch_size: i64,
	) -> Result<Vec<ClaimedJob>, QueueError> {
		let jobs = sqlx::query_as::<_, ClaimedJob>(
			"WITH picked AS ( \
				SELECT id FROM jobs \
				WHERE status = 'pending' \
				  AND available_at <= now() \
				  AND ($1::text IS NULL OR job_type = $1) \
				ORDER BY priority DESC, created_at ASC \
				LIMIT $2 \
				FOR UPDATE SKIP LOCKED \
			) \
			UPDATE jobs SET \
				status = 'processing', \
				started_at = now(), \
				locked_at = now(), \
				worker_id = $3, \
				attempts = attempts + 1, \
				updated_at = now() \
			WHERE id IN (SELECT id FROM picked) \
			RETURNING id, job_type, payload, priority, attempts, max_attempts",
		)
		.bind(job_type)
		.bind(batch_size)
		.bind(&self.worker_id)
		.fetch_all(&self.pool)
		.await?;

		if !jobs.is_empty() {
			debug!(count = jobs.len(), "Claimed jobs");
		}
		Ok(jobs)
	}

	pub async fn complete(&self, id: Uuid, result: Option<&Value>) -> Result<(), QueueError> {
		let updated = sqlx::query(
			"UPDATE jobs SET status = 'completed', completed_at = now(), result = $2, \
			 updated_at = now() WHERE id = $1",
		)
		.bind(id)
		.bind(result)
		.execute(&self.pool)
		.await?;

		if updated.rows_affected() == 0 {
			return Err(QueueError::NotFound(id));
		}
		debug!(job_id = %id, "Completed job");
		Ok(())
	}

	/// Records a failure. Jobs with remaining attempts are rescheduled as
	/// `pending` after an exponential backoff; exhausted jobs move to the
	/// dead letter state and keep their row for audit and replay.
	pub async fn fail(&self, id: Uuid, error_message: &str) -> Result<FailOutcome, QueueError> {
		let mut tx = self.pool.begin().await?;

		let row: Option<(String, i32, i32)> = sqlx::query_as(
			"SELECT job_type, attempts, max_attempts FROM jobs WHERE id = $1 FOR UPDATE",
		)
		.bind(id)
		.fetch_optional(&mut *tx)
		.await?;

		let Some((job_type, attempts, max_attempts)) = row else {
			return Err(QueueError::NotFound(id));
		};

		let outcome = if attempts < max_attempts {
			let delay = backoff_delay(attempts);
			let available_at = Utc::now()
				+ chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

			sqlx::query(
				"UPDATE jobs SET status = 'pending', error_message = $2, available_at = $3, \
				 retry_after = $3, worker_id = NULL, locked_at = NULL, updated_at = now() \
				 WHERE id = $1",
			)
			.bind(id)
			.bind(error_message)
			.bind(available_at)
			.execute(&mut *tx)
			.await?;

			debug!(
				job_id = %id,
				attempt = attempts,
				max_attempts,
				backoff_secs = delay.as_secs(),
				"Rescheduled failed job"
			);
			FailOutcome::Retry(delay)
		} else {
			sqlx::query(
				"UPDATE jobs SET status = 'dead_letter', error_message = $2, \
				 completed_at = now(), worker_id = NULL, locked_at = NULL, updated_at = now() \
				 WHERE id = $1",
			)
			.bind(id)
			.bind(error_message)
			.execute(&mut *tx)
			.await?;

			warn!(job_id = %id, attempts, "Job moved to dead letter queue");
			FailOutcome::DeadLetter
		};

		tx.commit().await?;

		if matches!(outcome, FailOutcome::Retry(_)) {
			self.notify(&job_type).await;
		}
		Ok(outcome)
	}

	/// Moves a job straight to the dead letter state, bypassing retries.
	/// Used for jobs that can never succeed, e.g. an unknown job type.
	pub async fn discard(&self, id: Uuid, error_message: &str) -> Result<(), QueueError> {
		let updated = sqlx::query(
			"UPDATE jobs SET status = 'dead_letter', error_message = $2, completed_at = now(), \
			 worker_id = NULL, locked_at = NULL, updated_at = now() WHERE id = $1",
		)
		.bind(id)
		.bind(error_message)
		.execute(&self.pool)
		.await?;

		if updated.rows_affected() == 0 {
			return Err(QueueError::NotFound(id));
		}
		warn!(job_id = %id, "Discarded job to dead letter queue: {error_message}");
		Ok(())
	}

	/// Returns jobs stuck in `processing` beyond `stale_after` to `pending`.
	///
	/// The attempt counter is intentionally left as-is: the previous worker
	/// may have produced observable side effects before dying.
	pub async fn sweep_stale(&self, stale_after: Duration) -> Result<u64, QueueError> {
		let threshold = Utc::now()
			- chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

		let result = sqlx::query(
			"UPDATE jobs SET status = 'pending', worker_id = NULL, locked_at = NULL, \
			 updated_at = now() WHERE status = 'processing' AND locked_at < $1",
		)
		.bind(threshold)
		.execute(&self.pool)
		.await?;

		let count = result.rows_affected();
		if count > 0 {
			warn!(count, "Reset stale job claims");
		}
		Ok(count)
	}

	/// Releases this worker's unfinished claims, typically on shutdown after
	/// the grace period has elapsed.
	pub async fn release_claims(&self) -> Result<u64, QueueError> {
		let result = sqlx::query(
			"UPDATE jobs SET status = 'pending', worker_id = NULL, locked_at = NULL, \
			 updated_at = now() WHERE status = 'processing' AND worker_id = $1",
		)
		.bind(&self.worker_id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	/// Lists dead-letter jobs for inspection and replay, newest first.
	pub async fn dead_letters(&self, limit: i64) -> Result<Vec<JobRow>, QueueError> {
		let rows = sqlx::query_as::<_, JobRow>(
			"SELECT * FROM jobs WHERE status = 'dead_letter' \
			 ORDER BY completed_at DESC NULLS LAST LIMIT $1",
		)
		.bind(limit)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	/// Re-inserts dead-letter jobs as `pending` with a fresh attempt budget.
	pub async fn replay(&self, ids: &[Uuid]) -> Result<u64, QueueError> {
		let result = sqlx::query(
			"UPDATE jobs SET status = 'pending', attempts = 0, error_message = NULL, \
			 completed_at = NULL, available_at = now(), updated_at = now() \
			 WHERE status = 'dead_letter' AND id = ANY($1)",
		)
		.bind(ids)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
		let rows: Vec<(String, i64)> =
			sqlx::query_as("SELECT status, count(*) FROM jobs GROUP BY status")
				.fetch_all(&self.pool)
				.await?;

		Ok(fold_depth(&rows))
	}

	/// Best-effort NOTIFY on the job-type channel and the catch-all channel.
	/// Failure to notify is logged and otherwise ignored; pollers will pick
	/// the job up within one interval.
	async fn notify(&self, job_type: &str) {
		for channel in [job_channel(Some(job_type)), job_channel(None)] {
			let result = sqlx::query("SELECT pg_notify($1, 'job_available')")
				.bind(&channel)
				.execute(&self.pool)
				.await;
			if let Err(err) = result {
				warn!(channel = %channel, "Failed to post job notification: {err}");
			}
		}
	}
}

/// Delay before attempt `attempts + 1`, doubling per failed attempt:
/// 1s, 2s, 4s, 8s, ...
pub fn backoff_delay(attempts: i32) -> Duration {
	let exponent = u32::try_from(attempts.max(1) - 1).unwrap_or(0).min(16);
	Duration::from_secs(1 << exponent)
}

/// Notification channel for a job type, or the catch-all channel.
pub fn job_channel(job_type: Option<&str>) -> String {
	match job_type {
		Some(job_type) => format!("job_queue_{job_type}"),
		None => String::from("job_queue_all"),
	}
}

fn fold_depth(rows: &[(String, i64)]) -> QueueDepth {
	let mut depth = QueueDepth::default();
	for (status, count) in rows {
		match JobStatus::from_str(status) {
			Ok(JobStatus::Pending) => depth.pending = *count,
			Ok(JobStatus::Processing) => depth.processing = *count,
			Ok(JobStatus::Completed) => depth.completed = *count,
			Ok(JobStatus::DeadLetter) => depth.dead_letter = *count,
			_ => {}
		}
	}
	depth
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_per_attempt() {
		assert_eq!(backoff_delay(1), Duration::from_secs(1));
		assert_eq!(backoff_delay(2), Duration::from_secs(2));
		assert_eq!(backoff_delay(3), Duration::from_secs(4));
		assert_eq!(backoff_delay(4), Duration::from_secs(8));
	}

	#[test]
	fn backoff_clamps_degenerate_attempts() {
		assert_eq!(backoff_delay(0), Duration::from_secs(1));
		assert_eq!(backoff_delay(-3), Duration::from_secs(1));
		assert_eq!(backoff_delay(1000), Duration::from_secs(1 << 16));
	}

	#[test]
	fn channel_names() {
		assert_eq!(
			job_channel(Some("process_received_file")),
			"job_queue_process_received_file"
		);
		assert_eq!(job_channel(None), "job_queue_all");
	}

	#[test]
	fn depth_folds_status_counts() {
		let rows = vec![
			(String::from("pending"), 7),
			(String::from("processing"), 2),
			(String::from("dead_letter"), 1),
			(String::from("garbage"), 99),
		];
		let depth = fold_depth(&rows);
		assert_eq!(depth.pending, 7);
		assert_eq!(depth.processing, 2);
		assert_eq!(depth.dead_letter, 1);
		assert_eq!(depth.completed, 0);
	}
}
