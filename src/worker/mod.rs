//! Generic queue worker harness.
//!
//! A [`QueueWorker`] owns a set of [`JobHandler`]s, wakes on queue
//! notifications (or the fallback poll), claims batches and dispatches
//! each job to its handler. A handler error fails only that job; the
//! worker itself keeps running. SIGTERM handling: stop claiming, let
//! in-flight jobs finish within the grace period, then release leftover
//! claims for the stale sweep to find immediately.

pub mod scaler;
pub mod supervisor;

use crate::config::QueueConfig;
use crate::queue::listener::JobSignal;
use crate::queue::{ClaimedJob, FailOutcome, JobQueue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
	fn job_type(&self) -> &'static str;

	async fn run(&self, job: &ClaimedJob) -> Result<serde_json::Value, anyhow::Error>;
}

#[derive(Debug, Default)]
struct WorkerStats {
	processed: u64,
	succeeded: u64,
	failed: u64,
}

pub struct QueueWorker {
	queue: JobQueue,
	config: QueueConfig,
	handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl QueueWorker {
	pub fn new(queue: JobQueue, config: QueueConfig) -> Self {
		Self {
			queue,
			config,
			handlers: HashMap::new(),
		}
	}

	/// Registers a handler for its job type. Panics on duplicate
	/// registration, which is a wiring bug.
	pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
		let job_type = handler.job_type();
		assert!(
			self.handlers.insert(job_type, handler).is_none(),
			"duplicate handler for job type {job_type}"
		);
		self
	}

	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		info!(worker_id = self.queue.worker_id(), "Starting queue worker");
		let shutdown_flag = shutdown.clone();
		let mut stats = WorkerStats::default();

		let mut signal = JobSignal::subscribe(
			self.queue.pool().clone(),
			None,
			self.config.poll_interval(),
		);
		let mut sweep = tokio::time::interval(self.config.sweep_interval());
		sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				() = signal.recv() => {}
				_ = sweep.tick() => {
					if let Err(err) = self.queue.sweep_stale(self.config.stale_after()).await {
						error!("Stale job sweep failed: {err}");
					}
					continue;
				}
				_ = shutdown.changed() => break,
			}

			tokio::select! {
				() = self.drain(&shutdown_flag, &mut stats) => {}
				() = wait_for_shutdown_grace(&mut shutdown, &self.config) => {
					warn!("Grace period expired with jobs in flight");
					break;
				}
			}

			if *shutdown.borrow() {
				break;
			}
		}

		let released = self.queue.release_claims().await.unwrap_or(0);
		info!(
			worker_id = self.queue.worker_id(),
			processed = stats.processed,
			succeeded = stats.succeeded,
			failed = stats.failed,
			released,
			"Queue worker stopped"
		);
		Ok(())
	}

	/// Claims and processes batches until the queue is empty or shutdown
	/// is requested.
	async fn drain(&self, shutdown: &watch::Receiver<bool>, stats: &mut WorkerStats) {
		while !*shutdown.borrow() {
			let jobs = match self.queue.claim(None, self.config.batch_size).await {
				Ok(jobs) => jobs,
				Err(err) => {
					error!("Failed to claim jobs: {err}");
					break;
				}
			};
			if jobs.is_empty() {
				break;
			}

			for job in jobs {
				self.dispatch(&job, stats).await;
			}
		}
	}

	#[instrument(skip_all, fields(job_id = %job.id, job_type = job.job_type, attempt = job.attempts))]
	async fn dispatch(&self, job: &ClaimedJob, stats: &mut WorkerStats) {
		stats.processed += 1;

		let Some(handler) = self.handlers.get(job.job_type.as_str()) else {
			stats.failed += 1;
			let message = format!("Unknown job type: {}", job.job_type);
			if let Err(err) = self.queue.discard(job.id, &message).await {
				error!("Failed to discard job: {err}");
			}
			return;
		};

		match handler.run(job).await {
			Ok(result) => {
				if let Err(err) = self.queue.complete(job.id, Some(&result)).await {
					error!("Failed to complete job: {err}");
				}
				stats.succeeded += 1;
				debug!("Job completed");
			}
			Err(job_error) => {
				stats.failed += 1;
				match self.queue.fail(job.id, &format!("{job_error:#}")).await {
					Ok(FailOutcome::Retry(delay)) => warn!(
						backoff_secs = delay.as_secs(),
						"Job failed, will retry: {job_error:#}"
					),
					Ok(FailOutcome::DeadLetter) => {
						error!("Job failed terminally: {job_error:#}");
					}
					Err(err) => error!("Failed to record job failure: {err}"),
				}
			}
		}
	}
}

/// Completes once a shutdown has been observed and the grace period for
/// in-flight work has elapsed.
pub(crate) async fn wait_for_shutdown_grace(
	shutdown: &mut watch::Receiver<bool>,
	config: &QueueConfig,
) {
	if !*shutdown.borrow() {
		let _ = shutdown.changed().await;
	}
	tokio::time::sleep(config.grace_period()).await;
}

/// Worker id of the form `{role}-{8 hex chars}`.
pub fn worker_id(role: &str) -> String {
	format!("{role}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn worker_ids_are_prefixed_and_unique() {
		let a = worker_id("catalog");
		let b = worker_id("catalog");
		assert!(a.starts_with("catalog-"));
		assert_eq!(a.len(), "catalog-".len() + 8);
		assert_ne!(a, b);
	}
}
