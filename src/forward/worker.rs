//! Forward worker: claims `ForwardJob` rows and executes the transfer.
//!
//! Claims follow the same SKIP-LOCKED discipline as the generic queue,
//! additionally requiring the destination to be enabled. Failures retry
//! through the shared exponential backoff and eventually dead-letter;
//! destination health counters are updated on every execution.

use crate::config::{ForwardingConfig, QueueConfig};
use crate::db::models::{DestinationRow, ForwardJobRow};
use crate::forward::scu::{StoreServiceClassUser, TransferOutcome};
use crate::queue::backoff_delay;
use crate::storage::{StorageError, StorageTree};
use crate::worker::wait_for_shutdown_grace;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ForwardError {
	#[error(transparent)]
	Database(#[from] sqlx::Error),
	#[error("Destination {0} no longer exists")]
	UnknownDestination(Uuid),
	#[error("Study {0} no longer exists")]
	UnknownStudy(Uuid),
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedForwardJob {
	pub id: Uuid,
	pub study_id: Uuid,
	pub destination_id: Uuid,
	pub attempts: i32,
	pub max_attempts: i32,
}

pub struct ForwardWorker {
	pool: PgPool,
	storage: StorageTree,
	scu: StoreServiceClassUser,
	forwarding: ForwardingConfig,
	queue_config: QueueConfig,
	worker_id: String,
}

impl ForwardWorker {
	pub fn new(
		pool: PgPool,
		storage: StorageTree,
		scu: StoreServiceClassUser,
		forwarding: ForwardingConfig,
		queue_config: QueueConfig,
	) -> Self {
		let worker_id = crate::worker::worker_id("forward");
		Self {
			pool,
			storage,
			scu,
			forwarding,
			queue_config,
			worker_id,
		}
	}

	/// Runs the claim/transfer loop until `shutdown` flips. Forward jobs
	/// are planned by direct row insertion, so there is no notification
	/// channel to subscribe to; the loop polls on the queue interval.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		info!(worker_id = %self.worker_id, "Starting forward worker");
		let shutdown_flag = shutdown.clone();
		let mut sweep = tokio::time::interval(self.queue_config.sweep_interval());
		sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				() = tokio::time::sleep(self.queue_config.poll_interval()) => {}
				_ = sweep.tick() => {
					if let Err(err) = self.sweep_stale().await {
						error!("Stale forward job sweep failed: {err}");
					}
					continue;
				}
				_ = shutdown.changed() => break,
			}

			let drain = async {
				while !*shutdown_flag.borrow() {
					match self.claim().await {
						Ok(jobs) if jobs.is_empty() => break,
						Ok(jobs) => {
							for job in jobs {
								self.process(job).await;
							}
						}
						Err(err) => {
							error!("Failed to claim forward jobs: {err}");
							break;
						}
					}
				}
			};

			tokio::select! {
				() = drain => {}
				() = wait_for_shutdown_grace(&mut shutdown, &self.queue_config) => {
					warn!("Grace period expired with forward jobs in flight");
					break;
				}
			}

			if *shutdown.borrow() {
				break;
			}
		}

		let released = self.release_claims().await.unwrap_or(0);
		info!(
			worker_id = %self.worker_id,
			released, "Forward worker stopped"
		);
		Ok(())
	}

	/// Claims up to the configured batch of eligible forward jobs whose
	/// destination is enabled.
	pub async fn claim(&self) -> Result<Vec<ClaimedForwardJob>, ForwardError> {
		let jobs = sqlx::query_as::<_, ClaimedForwardJob>(
			"WITH picked AS ( \
				SELECT fj.id FROM forward_jobs fj \
				JOIN destinations d ON d.id = fj.destination_id \
				WHERE fj.status = 'pending' \
				  AND fj.available_at <= now() \
				  AND d.enabled \
				ORDER BY fj.priority DESC, fj.created_at ASC \
				LIMIT $1 \
				FOR UPDATE OF fj SKIP LOCKED \
			) \
			UPDATE forward_jobs SET \
				status = 'processing', \
				started_at = now(), \
				locked_at = now(), \
				worker_id = $2, \
				attempts = attempts + 1, \
				updated_at = now() \
			WHERE id IN (SELECT id FROM picked) \
			RETURNING id, study_id, destination_id, attempts, max_attempts",
		)
		.bind(self.forwarding.batch_size)
		.bind(&self.worker_id)
		.fetch_all(&self.pool)
		.await?;

		Ok(jobs)
	}

	#[instrument(skip_all, fields(forward_job_id = %job.id, attempt = job.attempts))]
	async fn process(&self, job: ClaimedForwardJob) {
		let started = Instant::now();

		let result = self.transfer(&job).await;
		let duration_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);

		let settle = match result {
			Ok(outcome) if outcome.instances_failed == 0 => {
				self.settle_success(&job, &outcome, duration_ms).await
			}
			Ok(outcome) => {
				let message = format!(
					"{} of {} instances failed: {}",
					outcome.instances_failed,
					outcome.instances_sent + outcome.instances_failed,
					outcome.failures.join("; ")
				);
				self.settle_failure(&job, Some(&outcome), duration_ms, &message)
					.await
			}
			Err(err) => {
				self.settle_failure(&job, None, duration_ms, &format!("{err:#}"))
					.await
			}
		};

		if let Err(err) = settle {
			error!("Failed to record forward job outcome: {err}");
		}
	}

	async fn transfer(&self, job: &ClaimedForwardJob) -> anyhow::Result<TransferOutcome> {
		let destination = self.destination(job.destination_id).await?;
		let study_instance_uid = self.study_uid(job.study_id).await?;

		let files = match self.storage.study_files(&study_instance_uid).await {
			Ok(files) => files,
			Err(StorageError::MissingStudy(path)) => {
				anyhow::bail!("Study directory missing: {}", path.display())
			}
			Err(err) => return Err(err.into()),
		};
		if files.is_empty() {
			anyhow::bail!("Study {study_instance_uid} has no stored instances");
		}

		debug!(
			study_instance_uid = %study_instance_uid,
			destination = %destination.name,
			instances = files.len(),
			"Forwarding study"
		);
		Ok(self.scu.send_study(&destination, &files).await?)
	}

	/// Success path: job completed, study forwarded, destination healthy.
	async fn settle_success(
		&self,
		job: &ClaimedForwardJob,
		outcome: &TransferOutcome,
		duration_ms: i32,
	) -> Result<(), ForwardError> {
		let mut tx = self.pool.begin().await?;

		sqlx::query(
			"UPDATE forward_jobs SET status = 'completed', completed_at = now(), \
			 error_message = NULL, duration_ms = $2, instances_sent = $3, instances_failed = 0, \
			 worker_id = NULL, locked_at = NULL, updated_at = now() WHERE id = $1",
		)
		.bind(job.id)
		.bind(duration_ms)
		.bind(outcome.instances_sent)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"UPDATE studies SET status = 'forwarded', forwarded_at = now(), updated_at = now() \
			 WHERE id = $1",
		)
		.bind(job.study_id)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"UPDATE destinations SET last_success_at = now(), consecutive_failures = 0, \
			 updated_at = now() WHERE id = $1",
		)
		.bind(job.destination_id)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;

		info!(
			instances = outcome.instances_sent,
			duration_ms, "Forward job completed"
		);
		Ok(())
	}

	/// Failure path: reschedule with backoff or dead-letter, and bump the
	/// destination's failure counters either way.
	async fn settle_failure(
		&self,
		job: &ClaimedForwardJob,
		outcome: Option<&TransferOutcome>,
		duration_ms: i32,
		message: &str,
	) -> Result<(), ForwardError> {
		let (sent, failed) = outcome
			.map(|outcome| (outcome.instances_sent, outcome.instances_failed))
			.unwrap_or((0, 0));

		let mut tx = self.pool.begin().await?;

		if job.attempts < job.max_attempts {
			let delay = backoff_delay(job.attempts);
			let available_at = Utc::now()
				+ chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

			sqlx::query(
				"UPDATE forward_jobs SET status = 'pending', error_message = $2, \
				 available_at = $3, retry_after = $3, duration_ms = $4, instances_sent = $5, \
				 instances_failed = $6, worker_id = NULL, locked_at = NULL, updated_at = now() \
				 WHERE id = $1",
			)
			.bind(job.id)
			.bind(message)
			.bind(available_at)
			.bind(duration_ms)
			.bind(sent)
			.bind(failed)
			.execute(&mut *tx)
			.await?;

			warn!(
				attempt = job.attempts,
				max_attempts = job.max_attempts,
				backoff_secs = delay.as_secs(),
				"Forward job failed, rescheduled: {message}"
			);
		} else {
			sqlx::query(
				"UPDATE forward_jobs SET status = 'dead_letter', error_message = $2, \
				 completed_at = now(), duration_ms = $3, instances_sent = $4, \
				 instances_failed = $5, worker_id = NULL, locked_at = NULL, updated_at = now() \
				 WHERE id = $1",
			)
			.bind(job.id)
			.bind(message)
			.bind(duration_ms)
			.bind(sent)
			.bind(failed)
			.execute(&mut *tx)
			.await?;

			error!(
				attempts = job.attempts,
				"Forward job moved to dead letter queue: {message}"
			);
		}

		sqlx::query(
			"UPDATE destinations SET last_failure_at = now(), \
			 consecutive_failures = consecutive_failures + 1, updated_at = now() WHERE id = $1",
		)
		.bind(job.destination_id)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	async fn destination(&self, id: Uuid) -> Result<DestinationRow, ForwardError> {
		sqlx::query_as::<_, DestinationRow>("SELECT * FROM destinations WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?
			.ok_or(ForwardError::UnknownDestination(id))
	}

	async fn study_uid(&self, id: Uuid) -> Result<String, ForwardError> {
		let row: Option<(String,)> =
			sqlx::query_as("SELECT study_instance_uid FROM studies WHERE id = $1")
				.bind(id)
				.fetch_optional(&self.pool)
				.await?;
		row.map(|(uid,)| uid).ok_or(ForwardError::UnknownStudy(id))
	}

	/// Stale-claim sweep for the forward job table; same policy as the
	/// generic queue (attempts untouched).
	pub async fn sweep_stale(&self) -> Result<u64, ForwardError> {
		let threshold = Utc::now()
			- chrono::Duration::from_std(self.queue_config.stale_after())
				.unwrap_or_else(|_| chrono::Duration::zero());

		let result = sqlx::query(
			"UPDATE forward_jobs SET status = 'pending', worker_id = NULL, locked_at = NULL, \
			 updated_at = now() WHERE status = 'processing' AND locked_at < $1",
		)
		.bind(threshold)
		.execute(&self.pool)
		.await?;

		let count = result.rows_affected();
		if count > 0 {
			warn!(count, "Reset stale forward job claims");
		}
		Ok(count)
	}

	/// Lists dead-letter forward jobs for inspection, newest first.
	pub async fn dead_letters(pool: &PgPool, limit: i64) -> Result<Vec<ForwardJobRow>, ForwardError> {
		let rows = sqlx::query_as::<_, ForwardJobRow>(
			"SELECT * FROM forward_jobs WHERE status = 'dead_letter' \
			 ORDER BY completed_at DESC NULLS LAST LIMIT $1",
		)
		.bind(limit)
		.fetch_all(pool)
		.await?;
		Ok(rows)
	}

	/// Re-inserts dead-letter forward jobs as `pending` with a fresh
	/// attempt budget. Used by the replay hook of the admin surface.
	pub async fn replay(pool: &PgPool, ids: &[Uuid]) -> Result<u64, ForwardError> {
		let result = sqlx::query(
			"UPDATE forward_jobs SET status = 'pending', attempts = 0, error_message = NULL, \
			 completed_at = NULL, available_at = now(), updated_at = now() \
			 WHERE status = 'dead_letter' AND id = ANY($1)",
		)
		.bind(ids)
		.execute(pool)
		.await?;
		Ok(result.rows_affected())
	}

	pub async fn release_claims(&self) -> Result<u64, ForwardError> {
		let result = sqlx::query(
			"UPDATE forward_jobs SET status = 'pending', worker_id = NULL, locked_at = NULL, \
			 updated_at = now() WHERE status = 'processing' AND worker_id = $1",
		)
		.bind(&self.worker_id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}
}

