mod catalog;
mod config;
mod db;
mod dimse;
mod forward;
mod ingest;
mod queue;
mod storage;
mod types;
mod worker;

use crate::catalog::CatalogWriter;
use crate::config::AppConfig;
use crate::forward::scu::StoreServiceClassUser;
use crate::forward::worker::ForwardWorker;
use crate::forward::DispatchPlanner;
use crate::ingest::StoreServiceClassProvider;
use crate::queue::JobQueue;
use crate::storage::StorageTree;
use crate::worker::scaler::WorkerAutoscaler;
use crate::worker::supervisor::SystemdSupervisor;
use crate::worker::QueueWorker;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Default Application Entity title of the gateway.
pub const DEFAULT_AET: &str = "DICOM-GW";

fn init_logger(log_level: tracing::Level) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(log_level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level)?;

	// Sentry must be initialized before the async runtime starts.
	let _sentry_guard = config.telemetry.sentry.as_ref().map(|dsn| {
		sentry::init((
			dsn.as_str(),
			sentry::ClientOptions {
				release: sentry::release_name!(),
				..Default::default()
			},
		))
	});

	debug!("Config: {config:?}");

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<(), anyhow::Error> {
	let pool = db::connect(&config.database).await?;
	db::migrate(&pool).await?;

	let storage = StorageTree::new(config.storage.root.clone());
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	spawn_signal_handler(shutdown_tx)?;

	let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

	if config.roles.ingest {
		let event_pool = db::connect_event_pool(&config.database).await?;
		let events = db::events::spawn_writer(event_pool);
		let queue = JobQueue::new(pool.clone(), worker::worker_id("ingest"));
		let scp = StoreServiceClassProvider::new(
			config.dimse.clone(),
			config.queue.clone(),
			storage.clone(),
			queue,
			events,
		);

		let stats = scp.stats();
		let mut shutdown = shutdown_rx.clone();
		tasks.spawn(async move {
			let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
			let serve = scp.spawn();
			tokio::pin!(serve);
			loop {
				tokio::select! {
					result = &mut serve => return result,
					_ = ticker.tick() => {
						let snapshot = stats.snapshot();
						info!(
							received = snapshot.received,
							stored = snapshot.stored,
							failed = snapshot.failed,
							bytes_received = snapshot.bytes_received,
							"Receiver statistics"
						);
					}
					_ = shutdown.changed() => {
						info!("Stopping Store Service Class Provider");
						return Ok(());
					}
				}
			}
		});
	}

	if config.roles.catalog {
		let queue = JobQueue::new(pool.clone(), worker::worker_id("catalog"));
		let writer = CatalogWriter::new(
			pool.clone(),
			queue.clone(),
			config.forwarding.clone(),
		);
		let planner = DispatchPlanner::new(pool.clone(), config.forwarding.max_attempts);
		let queue_worker = QueueWorker::new(queue, config.queue.clone())
			.register(Arc::new(writer))
			.register(Arc::new(planner));

		let shutdown = shutdown_rx.clone();
		tasks.spawn(async move { queue_worker.run(shutdown).await });
	}

	if config.roles.forward {
		let scu = StoreServiceClassUser::new(config.dimse.aet.clone());
		let forward_worker = ForwardWorker::new(
			pool.clone(),
			storage.clone(),
			scu,
			config.forwarding.clone(),
			config.queue.clone(),
		);

		let shutdown = shutdown_rx.clone();
		tasks.spawn(async move { forward_worker.run(shutdown).await });
	}

	if config.roles.autoscaler {
		let supervisor = Arc::new(SystemdSupervisor::new(config.scaling.unit_prefix.clone()));
		let scaler = WorkerAutoscaler::new(pool.clone(), config.scaling.clone(), supervisor);

		let shutdown = shutdown_rx.clone();
		tasks.spawn(async move { scaler.run(shutdown).await });
	}

	if tasks.is_empty() {
		anyhow::bail!("No roles enabled; nothing to run");
	}

	while let Some(result) = tasks.join_next().await {
		result??;
	}

	info!("Gateway stopped");
	Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) -> Result<(), anyhow::Error> {
	#[cfg(unix)]
	let mut sigterm =
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

	tokio::spawn(async move {
		#[cfg(unix)]
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = sigterm.recv() => {}
		}
		#[cfg(not(unix))]
		let _ = tokio::signal::ctrl_c().await;

		info!("Shutdown signal received");
		let _ = shutdown_tx.send(true);
	});

	Ok(())
}
