//! Catalog writer: executes `process_received_file` jobs.
//!
//! Each job parses one stored file for its descriptor tags and upserts the
//! Study/Series/Instance hierarchy together with an ingest event in a
//! single transaction. Replays of an already-cataloged SOP instance are
//! detected up front and succeed without touching any counters.

use crate::config::ForwardingConfig;
use crate::forward::{TriggerForwardJob, TRIGGER_FORWARD};
use crate::queue::{ClaimedJob, EnqueueOptions, JobQueue, QueueError};
use crate::storage;
use crate::worker::JobHandler;
use chrono::{DateTime, Utc};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, Tag};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const PROCESS_RECEIVED_FILE: &str = "process_received_file";

/// Payload of a `process_received_file` job, produced by the Storage SCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedFileJob {
	pub file_path: String,
	pub sop_instance_uid: String,
	pub study_instance_uid: String,
	pub calling_ae_title: Option<String>,
	pub called_ae_title: String,
	pub receive_duration_ms: i32,
	pub storage_duration_ms: i32,
	pub file_size_bytes: i64,
	pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
	#[error("Invalid job payload: {0}")]
	Payload(#[from] serde_json::Error),
	#[error("Stored file is missing: {0}")]
	MissingFile(String),
	#[error("Failed to parse stored file: {0}")]
	Parse(#[from] dicom::object::ReadError),
	#[error("Stored file carries no {0}")]
	MissingAttribute(&'static str),
	#[error(transparent)]
	Database(#[from] sqlx::Error),
	#[error(transparent)]
	Queue(#[from] QueueError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// The descriptor tags the catalog reads from a stored file.
#[derive(Debug, Clone, Default)]
pub struct InstanceDescriptor {
	pub patient_id: Option<String>,
	pub patient_name: Option<String>,
	pub patient_birth_date: Option<String>,
	pub patient_sex: Option<String>,
	pub study_date: Option<String>,
	pub study_time: Option<String>,
	pub accession_number: Option<String>,
	pub study_description: Option<String>,
	pub referring_physician_name: Option<String>,
	pub modality: Option<String>,
	pub institution_name: Option<String>,
	pub series_instance_uid: Option<String>,
	pub series_number: Option<i32>,
	pub series_date: Option<String>,
	pub series_time: Option<String>,
	pub series_description: Option<String>,
	pub body_part_examined: Option<String>,
	pub protocol_name: Option<String>,
	pub sop_class_uid: Option<String>,
	pub instance_number: Option<i32>,
	pub content_date: Option<String>,
	pub content_time: Option<String>,
	pub transfer_syntax_uid: Option<String>,
}

impl InstanceDescriptor {
	/// Populates the descriptor from a parsed object. Pixel data is never
	/// read; callers open the file with a bounded read.
	pub fn from_object(object: &DefaultDicomObject) -> Self {
		Self {
			patient_id: element_str(object, tags::PATIENT_ID),
			patient_name: element_str(object, tags::PATIENT_NAME),
			patient_birth_date: element_str(object, tags::PATIENT_BIRTH_DATE),
			patient_sex: element_str(object, tags::PATIENT_SEX),
			study_date: element_str(object, tags::STUDY_DATE),
			study_time: element_str(object, tags::STUDY_TIME),
			accession_number: element_str(object, tags::ACCESSION_NUMBER),
			study_description: element_str(object, tags::STUDY_DESCRIPTION),
			referring_physician_name: element_str(object, tags::REFERRING_PHYSICIAN_NAME),
			modality: element_str(object, tags::MODALITY),
			institution_name: element_str(object, tags::INSTITUTION_NAME),
			series_instance_uid: element_str(object, tags::SERIES_INSTANCE_UID),
			series_number: element_int(object, tags::SERIES_NUMBER),
			series_date: element_str(object, tags::SERIES_DATE),
			series_time: element_str(object, tags::SERIES_TIME),
			series_description: element_str(object, tags::SERIES_DESCRIPTION),
			body_part_examined: element_str(object, tags::BODY_PART_EXAMINED),
			protocol_name: element_str(object, tags::PROTOCOL_NAME),
			sop_class_uid: element_str(object, tags::SOP_CLASS_UID),
			instance_number: element_int(object, tags::INSTANCE_NUMBER),
			content_date: element_str(object, tags::CONTENT_DATE),
			content_time: element_str(object, tags::CONTENT_TIME),
			transfer_syntax_uid: Some(String::from(storage::trim_uid(
				&object.meta().transfer_syntax,
			))),
		}
	}
}

fn element_str(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
	object
		.element(tag)
		.ok()
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches('\0').trim().to_string())
		.filter(|value| !value.is_empty())
}

fn element_int(object: &DefaultDicomObject, tag: Tag) -> Option<i32> {
	object
		.element(tag)
		.ok()
		.and_then(|element| element.to_int::<i32>().ok())
}

/// Outcome of one catalog transaction.
#[derive(Debug, Clone, Copy)]
pub enum IngestOutcome {
	Created { study_id: Uuid },
	/// The SOP instance was already cataloged; counters untouched.
	Duplicate { study_id: Option<Uuid> },
}

pub struct CatalogWriter {
	pool: PgPool,
	queue: JobQueue,
	forwarding: ForwardingConfig,
}

impl CatalogWriter {
	pub const fn new(pool: PgPool, queue: JobQueue, forwarding: ForwardingConfig) -> Self {
		Self {
			pool,
			queue,
			forwarding,
		}
	}

	#[instrument(skip_all, fields(sop_instance_uid = %job.sop_instance_uid))]
	pub async fn process(&self, job: &ReceivedFileJob) -> Result<serde_json::Value, CatalogError> {
		let path = Path::new(&job.file_path);
		if !path.is_file() {
			return Err(CatalogError::MissingFile(job.file_path.clone()));
		}

		let has_preamble = {
			let head = read_head(path, storage::PREAMBLE_SIZE + 4).await?;
			storage::dicom_magic(&head).unwrap_or(false)
		};

		let object = dicom::object::OpenFileOptions::new()
			.read_until(tags::PIXEL_DATA)
			.open_file(path)?;
		let descriptor = InstanceDescriptor::from_object(&object);

		let outcome = self.upsert(job, &descriptor, has_preamble).await?;

		let duplicate = match outcome {
			IngestOutcome::Created { study_id } => {
				debug!(study_id = %study_id, "Cataloged instance");
				if self.forwarding.eager {
					self.trigger_forward(&job.study_instance_uid).await?;
				}
				false
			}
			IngestOutcome::Duplicate { .. } => {
				info!("Instance already cataloged, recording replay");
				true
			}
		};

		Ok(serde_json::json!({
			"study_instance_uid": job.study_instance_uid,
			"series_instance_uid": descriptor.series_instance_uid,
			"sop_instance_uid": job.sop_instance_uid,
			"file_path": job.file_path,
			"duplicate": duplicate,
			"processed_at": Utc::now(),
		}))
	}

	/// Upserts Study, Series and Instance and appends the ingest event in
	/// one transaction. Counter increments only happen on the path that
	/// actually inserts the instance row.
	async fn upsert(
		&self,
		job: &ReceivedFileJob,
		descriptor: &InstanceDescriptor,
		has_preamble: bool,
	) -> Result<IngestOutcome, CatalogError> {
		let series_instance_uid = descriptor
			.series_instance_uid
			.as_deref()
			.ok_or(CatalogError::MissingAttribute("SeriesInstanceUID"))?;
		let sop_class_uid = descriptor
			.sop_class_uid
			.as_deref()
			.ok_or(CatalogError::MissingAttribute("SOPClassUID"))?;

		let mut tx = self.pool.begin().await?;

		let existing: Option<(Uuid,)> = sqlx::query_as(
			"SELECT se.study_id FROM instances i \
			 JOIN series se ON se.id = i.series_id \
			 WHERE i.sop_instance_uid = $1",
		)
		.bind(&job.sop_instance_uid)
		.fetch_optional(&mut *tx)
		.await?;

		if let Some((study_id,)) = existing {
			insert_event(&mut tx, job, Some(study_id)).await?;
			tx.commit().await?;
			return Ok(IngestOutcome::Duplicate {
				study_id: Some(study_id),
			});
		}

		let storage_path = Path::new(&job.file_path)
			.parent()
			.map(|parent| parent.display().to_string());

		let (study_id,): (Uuid,) = sqlx::query_as(
			"INSERT INTO studies (id, study_instance_uid, patient_id, patient_name, \
			 patient_birth_date, patient_sex, study_date, study_time, accession_number, \
			 study_description, referring_physician_name, modality, institution_name, \
			 status, storage_path, file_count, total_size_bytes) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'processing', $14, 1, $15) \
			 ON CONFLICT (study_instance_uid) DO UPDATE SET \
				file_count = studies.file_count + 1, \
				total_size_bytes = studies.total_size_bytes + EXCLUDED.total_size_bytes, \
				status = CASE WHEN studies.status = 'received' THEN 'processing' ELSE studies.status END, \
				updated_at = now() \
			 RETURNING id",
		)
		.bind(Uuid::new_v4())
		.bind(&job.study_instance_uid)
		.bind(&descriptor.patient_id)
		.bind(&descriptor.patient_name)
		.bind(&descriptor.patient_birth_date)
		.bind(&descriptor.patient_sex)
		.bind(&descriptor.study_date)
		.bind(&descriptor.study_time)
		.bind(&descriptor.accession_number)
		.bind(&descriptor.study_description)
		.bind(&descriptor.referring_physician_name)
		.bind(&descriptor.modality)
		.bind(&descriptor.institution_name)
		.bind(storage_path)
		.bind(job.file_size_bytes)
		.fetch_one(&mut *tx)
		.await?;

		let (series_id,): (Uuid,) = sqlx::query_as(
			"INSERT INTO series (id, study_id, series_instance_uid, series_number, \
			 series_date, series_time, modality, series_description, body_part_examined, \
			 protocol_name, instance_count, total_size_bytes) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1, $11) \
			 ON CONFLICT (series_instance_uid) DO UPDATE SET \
				instance_count = series.instance_count + 1, \
				total_size_bytes = series.total_size_bytes + EXCLUDED.total_size_bytes, \
				updated_at = now() \
			 RETURNING id",
		)
		.bind(Uuid::new_v4())
		.bind(study_id)
		.bind(series_instance_uid)
		.bind(descriptor.series_number)
		.bind(&descriptor.series_date)
		.bind(&descriptor.series_time)
		.bind(&descriptor.modality)
		.bind(&descriptor.series_description)
		.bind(&descriptor.body_part_examined)
		.bind(&descriptor.protocol_name)
		.bind(job.file_size_bytes)
		.fetch_one(&mut *tx)
		.await?;

		sqlx::query(
			"INSERT INTO instances (id, series_id, sop_instance_uid, sop_class_uid, \
			 instance_number, content_date, content_time, file_path, file_size_bytes, \
			 transfer_syntax_uid, has_preamble) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
		)
		.bind(Uuid::new_v4())
		.bind(series_id)
		.bind(&job.sop_instance_uid)
		.bind(sop_class_uid)
		.bind(descriptor.instance_number)
		.bind(&descriptor.content_date)
		.bind(&descriptor.content_time)
		.bind(&job.file_path)
		.bind(job.file_size_bytes)
		.bind(&descriptor.transfer_syntax_uid)
		.bind(has_preamble)
		.execute(&mut *tx)
		.await?;

		insert_event(&mut tx, job, Some(study_id)).await?;
		tx.commit().await?;

		Ok(IngestOutcome::Created { study_id })
	}

	/// Records a failed ingest event for a job that could not be
	/// cataloged. The file stays on disk; the job retries through the
	/// queue and eventually dead-letters.
	async fn record_failure(&self, job: &ReceivedFileJob, error: &str) {
		let result = sqlx::query(
			"INSERT INTO ingest_events (id, sop_instance_uid, calling_ae_title, \
			 called_ae_title, event_type, status, error_message, file_size_bytes) \
			 VALUES ($1, $2, $3, $4, 'failed', 'failed', $5, $6)",
		)
		.bind(Uuid::new_v4())
		.bind(&job.sop_instance_uid)
		.bind(&job.calling_ae_title)
		.bind(&job.called_ae_title)
		.bind(error)
		.bind(job.file_size_bytes)
		.execute(&self.pool)
		.await;

		if let Err(err) = result {
			warn!("Failed to record catalog failure event: {err}");
		}
	}

	async fn trigger_forward(&self, study_instance_uid: &str) -> Result<(), QueueError> {
		let trigger = TriggerForwardJob {
			study_instance_uid: String::from(study_instance_uid),
			destination_ids: None,
			priority: None,
		};
		self.queue
			.enqueue(
				TRIGGER_FORWARD,
				&serde_json::to_value(&trigger).unwrap_or_default(),
				EnqueueOptions {
					max_attempts: self.forwarding.max_attempts,
					..EnqueueOptions::default()
				},
			)
			.await?;
		Ok(())
	}
}

/// The `stored` event shares the catalog transaction so that the catalog
/// row and its audit trail commit or roll back together.
async fn insert_event(
	tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
	job: &ReceivedFileJob,
	study_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
	sqlx::query(
		"INSERT INTO ingest_events (id, study_id, sop_instance_uid, calling_ae_title, \
		 called_ae_title, event_type, status, receive_duration_ms, storage_duration_ms, \
		 file_size_bytes) \
		 VALUES ($1, $2, $3, $4, $5, 'stored', 'success', $6, $7, $8)",
	)
	.bind(Uuid::new_v4())
	.bind(study_id)
	.bind(&job.sop_instance_uid)
	.bind(&job.calling_ae_title)
	.bind(&job.called_ae_title)
	.bind(job.receive_duration_ms)
	.bind(job.storage_duration_ms)
	.bind(job.file_size_bytes)
	.execute(&mut **tx)
	.await?;
	Ok(())
}

async fn read_head(path: &Path, len: usize) -> Result<Vec<u8>, std::io::Error> {
	use tokio::io::AsyncReadExt;
	let mut file = tokio::fs::File::open(path).await?;
	let mut head = vec![0u8; len];
	let read = file.read(&mut head).await?;
	head.truncate(read);
	Ok(head)
}

#[async_trait::async_trait]
impl JobHandler for CatalogWriter {
	fn job_type(&self) -> &'static str {
		PROCESS_RECEIVED_FILE
	}

	async fn run(&self, job: &ClaimedJob) -> Result<serde_json::Value, anyhow::Error> {
		let payload: ReceivedFileJob = serde_json::from_value(job.payload.clone())
			.map_err(CatalogError::Payload)?;
		match self.process(&payload).await {
			Ok(result) => Ok(result),
			Err(err) => {
				self.record_failure(&payload, &format!("{err:#}")).await;
				Err(err.into())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

	fn sample_object() -> DefaultDicomObject {
		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
		));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.3.4"),
		));
		object.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.3"),
		));
		object.put(DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.3.9"),
		));
		object.put(DataElement::new(
			tags::PATIENT_NAME,
			VR::PN,
			dicom_value!(Str, "DOE^JANE"),
		));
		object.put(DataElement::new(
			tags::MODALITY,
			VR::CS,
			dicom_value!(Str, "CT"),
		));
		object.put(DataElement::new(
			tags::SERIES_NUMBER,
			VR::IS,
			dicom_value!(Str, "3"),
		));

		object.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
				.media_storage_sop_instance_uid("1.2.3.4")
				.transfer_syntax("1.2.840.10008.1.2.1")
				.build()
				.unwrap(),
		)
	}

	#[test]
	fn descriptor_reads_expected_tags() {
		let descriptor = InstanceDescriptor::from_object(&sample_object());

		assert_eq!(descriptor.patient_name.as_deref(), Some("DOE^JANE"));
		assert_eq!(descriptor.modality.as_deref(), Some("CT"));
		assert_eq!(descriptor.series_instance_uid.as_deref(), Some("1.2.3.9"));
		assert_eq!(descriptor.series_number, Some(3));
		assert_eq!(
			descriptor.sop_class_uid.as_deref(),
			Some("1.2.840.10008.5.1.4.1.1.2")
		);
		assert_eq!(
			descriptor.transfer_syntax_uid.as_deref(),
			Some("1.2.840.10008.1.2.1")
		);
		assert!(descriptor.accession_number.is_none());
	}

	#[test]
	fn received_file_job_round_trips_through_json() {
		let job = ReceivedFileJob {
			file_path: String::from("/var/lib/dicom-gw/1.2.3/1.2.3.4.dcm"),
			sop_instance_uid: String::from("1.2.3.4"),
			study_instance_uid: String::from("1.2.3"),
			calling_ae_title: Some(String::from("MODALITY")),
			called_ae_title: String::from("DICOM-GW"),
			receive_duration_ms: 12,
			storage_duration_ms: 4,
			file_size_bytes: 524_544,
			received_at: Utc::now(),
		};

		let value = serde_json::to_value(&job).unwrap();
		let parsed: ReceivedFileJob = serde_json::from_value(value).unwrap();
		assert_eq!(parsed.sop_instance_uid, job.sop_instance_uid);
		assert_eq!(parsed.file_size_bytes, 524_544);
	}
}
