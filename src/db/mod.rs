pub mod events;
pub mod models;

use crate::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Opens the general-purpose connection pool.
///
/// Connections are probed before use and recycled after `max_lifetime` so
/// that the pool survives database restarts and stateful middleboxes.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
	let pool = PgPoolOptions::new()
		.min_connections(config.pool_min)
		.max_connections(config.pool_max)
		.acquire_timeout(config.acquire_timeout())
		.max_lifetime(config.max_lifetime())
		.test_before_acquire(true)
		.connect(&config.url)
		.await?;

	info!(
		min = config.pool_min,
		max = config.pool_max,
		"Opened database connection pool"
	);
	Ok(pool)
}

/// Opens the small dedicated pool used for batched event insertion.
/// Keeping it separate prevents bulk writes from starving the claim path.
pub async fn connect_event_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
	PgPoolOptions::new()
		.min_connections(1)
		.max_connections(config.event_pool_size)
		.acquire_timeout(config.acquire_timeout())
		.max_lifetime(config.max_lifetime())
		.test_before_acquire(true)
		.connect(&config.url)
		.await
}

/// Applies the schema migrations under `migrations/`.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
	sqlx::migrate!("./migrations").run(pool).await
}
