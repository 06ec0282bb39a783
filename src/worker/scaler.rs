//! Queue-depth-driven autoscaling of worker instances.
//!
//! Every check interval the scaler samples pending/processing counts for
//! the generic job queue and the forward-job queue, asks the supervisor
//! for the running instance count per worker type, and moves each count
//! by at most one step within its configured bounds. Cooldowns keep the
//! scaler from flapping.

use crate::config::{ScaleBounds, ScalingConfig};
use crate::types::WorkerKind;
use crate::worker::supervisor::Supervisor;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSample {
	pub pending: i64,
	pub processing: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
	Up { instance_id: usize },
	Down { instance_id: usize },
}

/// Pure scaling decision for one worker type.
///
/// Scale up by one when either threshold is reached and the cooldown has
/// elapsed; scale down by one when both lower thresholds are met and the
/// (longer) scale-down cooldown has elapsed.
pub fn decide(
	config: &ScalingConfig,
	bounds: ScaleBounds,
	sample: QueueSample,
	running: usize,
	elapsed_since_up: Option<Duration>,
	elapsed_since_down: Option<Duration>,
) -> Option<ScaleAction> {
	let up_cooldown_over =
		elapsed_since_up.is_none_or(|d| d >= Duration::from_secs(config.scale_up_cooldown));
	let down_cooldown_over =
		elapsed_since_down.is_none_or(|d| d >= Duration::from_secs(config.scale_down_cooldown));

	if (sample.pending >= config.scale_up_pending
		|| sample.processing >= config.scale_up_processing)
		&& running < bounds.max
		&& up_cooldown_over
	{
		return Some(ScaleAction::Up {
			instance_id: running,
		});
	}

	if sample.pending <= config.scale_down_pending
		&& sample.processing <= config.scale_down_processing
		&& running > bounds.min
		&& down_cooldown_over
	{
		return Some(ScaleAction::Down {
			instance_id: running - 1,
		});
	}

	None
}

pub struct WorkerAutoscaler {
	pool: PgPool,
	config: ScalingConfig,
	supervisor: Arc<dyn Supervisor>,
	last_scale_up: HashMap<WorkerKind, Instant>,
	last_scale_down: HashMap<WorkerKind, Instant>,
}

impl WorkerAutoscaler {
	pub fn new(pool: PgPool, config: ScalingConfig, supervisor: Arc<dyn Supervisor>) -> Self {
		Self {
			pool,
			config,
			supervisor,
			last_scale_up: HashMap::new(),
			last_scale_down: HashMap::new(),
		}
	}

	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		info!(
			interval_secs = self.config.check_interval,
			"Starting worker autoscaler"
		);
		let mut ticker = tokio::time::interval(self.config.check_interval());
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					if let Err(err) = self.check_and_scale().await {
						error!("Autoscaler check failed: {err:#}");
					}
				}
				_ = shutdown.changed() => break,
			}
		}

		info!("Worker autoscaler stopped");
		Ok(())
	}

	async fn check_and_scale(&mut self) -> anyhow::Result<()> {
		let jobs = self.sample("jobs").await?;
		let forward_jobs = self.sample("forward_jobs").await?;
		debug!(?jobs, ?forward_jobs, "Sampled queue depths");

		for kind in WorkerKind::ALL {
			// Forward workers scale on the forward-job queue; ingest and
			// catalog workers scale on the generic queue that ingest feeds.
			let sample = match kind {
				WorkerKind::Forward => forward_jobs,
				WorkerKind::Ingest | WorkerKind::Catalog => jobs,
			};
			self.scale_kind(kind, sample).await;
		}
		Ok(())
	}

	async fn scale_kind(&mut self, kind: WorkerKind, sample: QueueSample) {
		let running = match self.supervisor.list_instances(kind).await {
			Ok(running) => running,
			Err(err) => {
				error!(%kind, "Failed to list worker instances: {err}");
				return;
			}
		};

		let now = Instant::now();
		let action = decide(
			&self.config,
			self.config.bounds(kind),
			sample,
			running,
			self.last_scale_up.get(&kind).map(|at| now - *at),
			self.last_scale_down.get(&kind).map(|at| now - *at),
		);

		match action {
			Some(ScaleAction::Up { instance_id }) => {
				info!(
					%kind,
					running,
					pending = sample.pending,
					processing = sample.processing,
					"Scaling up"
				);
				if self.supervisor.start_instance(kind, instance_id).await.is_ok() {
					self.last_scale_up.insert(kind, now);
				}
			}
			Some(ScaleAction::Down { instance_id }) => {
				info!(
					%kind,
					running,
					pending = sample.pending,
					processing = sample.processing,
					"Scaling down"
				);
				if self.supervisor.stop_instance(kind, instance_id).await.is_ok() {
					self.last_scale_down.insert(kind, now);
				}
			}
			None => {}
		}
	}

	/// Pending/processing counts for one of the two job tables.
	async fn sample(&self, table: &str) -> Result<QueueSample, sqlx::Error> {
		// `table` is one of two compile-time constants, never user input.
		let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
			"SELECT status, count(*) FROM {table} \
			 WHERE status IN ('pending', 'processing') GROUP BY status"
		))
		.fetch_all(&self.pool)
		.await?;

		let mut sample = QueueSample::default();
		for (status, count) in rows {
			match status.as_str() {
				"pending" => sample.pending = count,
				"processing" => sample.processing = count,
				_ => {}
			}
		}
		Ok(sample)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> ScalingConfig {
		ScalingConfig::default()
	}

	const BOUNDS: ScaleBounds = ScaleBounds { min: 1, max: 4 };

	fn sample(pending: i64, processing: i64) -> QueueSample {
		QueueSample {
			pending,
			processing,
		}
	}

	#[test]
	fn scales_up_on_either_threshold() {
		let up = decide(&config(), BOUNDS, sample(50, 0), 2, None, None);
		assert_eq!(up, Some(ScaleAction::Up { instance_id: 2 }));

		let up = decide(&config(), BOUNDS, sample(0, 10), 2, None, None);
		assert_eq!(up, Some(ScaleAction::Up { instance_id: 2 }));
	}

	#[test]
	fn respects_max_and_up_cooldown() {
		assert_eq!(decide(&config(), BOUNDS, sample(100, 0), 4, None, None), None);

		let recent = Some(Duration::from_secs(10));
		assert_eq!(decide(&config(), BOUNDS, sample(100, 0), 2, recent, None), None);

		let elapsed = Some(Duration::from_secs(61));
		assert_eq!(
			decide(&config(), BOUNDS, sample(100, 0), 2, elapsed, None),
			Some(ScaleAction::Up { instance_id: 2 })
		);
	}

	#[test]
	fn scales_down_only_when_both_thresholds_met() {
		assert_eq!(
			decide(&config(), BOUNDS, sample(5, 2), 3, None, None),
			Some(ScaleAction::Down { instance_id: 2 })
		);
		// Pending low but processing still busy.
		assert_eq!(decide(&config(), BOUNDS, sample(5, 3), 3, None, None), None);
	}

	#[test]
	fn respects_min_and_down_cooldown() {
		assert_eq!(decide(&config(), BOUNDS, sample(0, 0), 1, None, None), None);

		let recent = Some(Duration::from_secs(100));
		assert_eq!(decide(&config(), BOUNDS, sample(0, 0), 3, None, recent), None);

		let elapsed = Some(Duration::from_secs(301));
		assert_eq!(
			decide(&config(), BOUNDS, sample(0, 0), 3, None, elapsed),
			Some(ScaleAction::Down { instance_id: 2 })
		);
	}

	#[test]
	fn idle_midrange_holds_steady() {
		assert_eq!(decide(&config(), BOUNDS, sample(20, 5), 2, None, None), None);
	}
}
