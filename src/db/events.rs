//! Batched insertion of ingest events.
//!
//! The Storage SCP produces one event per received object. Under load this
//! is the highest-volume write in the system, so events that do not need to
//! be transactional with catalog upserts are coalesced into multi-row
//! INSERTs over a dedicated pool.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NewIngestEvent {
	pub study_id: Option<Uuid>,
	pub sop_instance_uid: Option<String>,
	pub calling_ae_title: Option<String>,
	pub called_ae_title: Option<String>,
	pub source_ip: Option<String>,
	pub event_type: &'static str,
	pub status: &'static str,
	pub error_message: Option<String>,
	pub receive_duration_ms: Option<i32>,
	pub storage_duration_ms: Option<i32>,
	pub file_size_bytes: Option<i64>,
	pub created_at: DateTime<Utc>,
}

/// Cloneable handle for submitting events to the batch writer.
#[derive(Debug, Clone)]
pub struct IngestEventSink {
	tx: mpsc::Sender<NewIngestEvent>,
}

impl IngestEventSink {
	/// Submits an event for eventual insertion. Events are dropped (with a
	/// log record) if the writer cannot keep up; the event log is
	/// observability data, not a correctness dependency.
	pub async fn submit(&self, event: NewIngestEvent) {
		if let Err(err) = self.tx.send(event).await {
			error!("Ingest event writer is gone, dropping event: {err}");
		}
	}
}

/// Spawns the background batch writer and returns its submission handle.
pub fn spawn_writer(pool: PgPool) -> IngestEventSink {
	spawn_writer_with(pool, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL)
}

pub fn spawn_writer_with(
	pool: PgPool,
	batch_size: usize,
	flush_interval: Duration,
) -> IngestEventSink {
	let (tx, mut rx) = mpsc::channel::<NewIngestEvent>(batch_size * 4);

	tokio::spawn(async move {
		let mut batch: Vec<NewIngestEvent> = Vec::with_capacity(batch_size);
		let mut ticker = tokio::time::interval(flush_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				received = rx.recv() => match received {
					Some(event) => {
						batch.push(event);
						if batch.len() >= batch_size {
							flush(&pool, &mut batch).await;
						}
					}
					None => {
						flush(&pool, &mut batch).await;
						info!("Ingest event writer stopped");
						break;
					}
				},
				_ = ticker.tick() => flush(&pool, &mut batch).await,
			}
		}
	});

	IngestEventSink { tx }
}

async fn flush(pool: &PgPool, batch: &mut Vec<NewIngestEvent>) {
	if batch.is_empty() {
		return;
	}

	let count = batch.len();
	let mut builder = QueryBuilder::new(
		"INSERT INTO ingest_events (id, study_id, sop_instance_uid, calling_ae_title, \
		 called_ae_title, source_ip, event_type, status, error_message, \
		 receive_duration_ms, storage_duration_ms, file_size_bytes, created_at) ",
	);
	builder.push_values(batch.drain(..), |mut row, event| {
		row.push_bind(Uuid::new_v4())
			.push_bind(event.study_id)
			.push_bind(event.sop_instance_uid)
			.push_bind(event.calling_ae_title)
			.push_bind(event.called_ae_title)
			.push_bind(event.source_ip)
			.push_bind(event.event_type)
			.push_bind(event.status)
			.push_bind(event.error_message)
			.push_bind(event.receive_duration_ms)
			.push_bind(event.storage_duration_ms)
			.push_bind(event.file_size_bytes)
			.push_bind(event.created_at);
	});

	match builder.build().execute(pool).await {
		Ok(_) => debug!(count, "Flushed ingest event batch"),
		Err(err) => error!(count, "Failed to flush ingest event batch: {err}"),
	}
}

impl NewIngestEvent {
	pub fn received(sop_instance_uid: &str) -> Self {
		Self {
			study_id: None,
			sop_instance_uid: Some(String::from(sop_instance_uid)),
			calling_ae_title: None,
			called_ae_title: None,
			source_ip: None,
			event_type: "received",
			status: "success",
			error_message: None,
			receive_duration_ms: None,
			storage_duration_ms: None,
			file_size_bytes: None,
			created_at: Utc::now(),
		}
	}

	pub fn failed(sop_instance_uid: Option<&str>, error: &str) -> Self {
		Self {
			study_id: None,
			sop_instance_uid: sop_instance_uid.map(String::from),
			calling_ae_title: None,
			called_ae_title: None,
			source_ip: None,
			event_type: "failed",
			status: "failed",
			error_message: Some(String::from(error)),
			receive_duration_ms: None,
			storage_duration_ms: None,
			file_size_bytes: None,
			created_at: Utc::now(),
		}
	}

	pub fn with_peer(
		mut self,
		calling_aet: Option<&str>,
		called_aet: &str,
		source_ip: Option<&str>,
	) -> Self {
		self.calling_ae_title = calling_aet.map(String::from);
		self.called_ae_title = Some(String::from(called_aet));
		self.source_ip = source_ip.map(String::from);
		self
	}

	pub const fn with_timings(
		mut self,
		receive_duration_ms: i32,
		storage_duration_ms: i32,
		file_size_bytes: i64,
	) -> Self {
		self.receive_duration_ms = Some(receive_duration_ms);
		self.storage_duration_ms = Some(storage_duration_ms);
		self.file_size_bytes = Some(file_size_bytes);
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_builders_fill_defaults() {
		let event = NewIngestEvent::received("1.2.3.4")
			.with_peer(Some("MODALITY"), "DICOM-GW", Some("10.0.0.7"))
			.with_timings(12, 3, 524_544);

		assert_eq!(event.event_type, "received");
		assert_eq!(event.status, "success");
		assert_eq!(event.sop_instance_uid.as_deref(), Some("1.2.3.4"));
		assert_eq!(event.calling_ae_title.as_deref(), Some("MODALITY"));
		assert_eq!(event.file_size_bytes, Some(524_544));
		assert!(event.error_message.is_none());

		let failed = NewIngestEvent::failed(None, "disk full");
		assert_eq!(failed.event_type, "failed");
		assert_eq!(failed.status, "failed");
		assert_eq!(failed.error_message.as_deref(), Some("disk full"));
	}
}
