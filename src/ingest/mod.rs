//! Storage SCP: accepts associations from upstream modalities, persists
//! received composite objects byte-for-byte and enqueues one
//! `process_received_file` job per instance.
//!
//! A C-STORE request is only acknowledged with a success status after the
//! file is durable on disk and the catalog job is committed to the queue;
//! any failure before that point is reported as a processing failure so
//! the peer retries.

pub mod scan;

use crate::catalog::{ReceivedFileJob, PROCESS_RECEIVED_FILE};
use crate::config::{DimseServerConfig, QueueConfig};
use crate::db::events::{IngestEventSink, NewIngestEvent};
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::dimse::cstore::{CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST};
use crate::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, STATUS_PROCESSING_FAILURE,
	STATUS_SUCCESS,
};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::storage::{compose_file, StorageTree};
use crate::types::UI;
use anyhow::Context;
use chrono::Utc;
use dicom::dictionary_std::tags;
use dicom::object::FileMetaTableBuilder;
use dicom::ul::Pdu;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Counters exposed by the receiver.
#[derive(Debug, Default)]
pub struct IngestStats {
	received: AtomicU64,
	stored: AtomicU64,
	failed: AtomicU64,
	bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
	pub received: u64,
	pub stored: u64,
	pub failed: u64,
	pub bytes_received: u64,
}

impl IngestStats {
	pub fn snapshot(&self) -> IngestStatsSnapshot {
		IngestStatsSnapshot {
			received: self.received.load(Ordering::Relaxed),
			stored: self.stored.load(Ordering::Relaxed),
			failed: self.failed.load(Ordering::Relaxed),
			bytes_received: self.bytes_received.load(Ordering::Relaxed),
		}
	}

	fn record_stored(&self, bytes: u64) {
		self.received.fetch_add(1, Ordering::Relaxed);
		self.stored.fetch_add(1, Ordering::Relaxed);
		self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
	}

	fn record_failed(&self) {
		self.received.fetch_add(1, Ordering::Relaxed);
		self.failed.fetch_add(1, Ordering::Relaxed);
	}
}

pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	config: DimseServerConfig,
	queue_config: QueueConfig,
	storage: StorageTree,
	queue: JobQueue,
	events: IngestEventSink,
	stats: Arc<IngestStats>,
}

impl StoreServiceClassProvider {
	pub fn new(
		config: DimseServerConfig,
		queue_config: QueueConfig,
		storage: StorageTree,
		queue: JobQueue,
		events: IngestEventSink,
	) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				config,
				queue_config,
				storage,
				queue,
				events,
				stats: Arc::new(IngestStats::default()),
			}),
		}
	}

	pub fn stats(&self) -> Arc<IngestStats> {
		Arc::clone(&self.inner.stats)
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		self.inner.storage.prepare().await?;

		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!(aet = %self.inner.config.aet, "Started Store Service Class Provider on {address}");
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.config.aet,
						peer = peer.to_string()
					);
					debug!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, peer, inner).instrument(span).await
						{
							error!("{err:#}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		peer: SocketAddr,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// The `dicom-ul` crate does not use non-blocking reads/writes. The
		// actual I/O happens in ServerAssociation, which moves it to a
		// dedicated thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;
		let calling_aet = String::from(association.calling_aet());

		loop {
			let receive_started = Instant::now();
			let message = match association
				.read_message(inner.config.association_timeout())
				.await
			{
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					if let Err(err) = association
						.send(Pdu::ReleaseRP, inner.config.operation_timeout())
						.await
					{
						warn!("Failed to confirm association release: {err}");
					}
					if let Err(err) = association.release(inner.config.operation_timeout()).await {
						debug!("Failed to stop association backend: {err}");
					}
					debug!("Association released by {calling_aet}");
					break;
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { .. })) => {
					debug!("Association aborted by {calling_aet}");
					break;
				}
				Err(err) => return Err(err.into()),
			};
			let receive_duration = receive_started.elapsed();

			let receive_duration_ms =
				i32::try_from(receive_duration.as_millis()).unwrap_or(i32::MAX);
			match message.command_field() {
				Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
					Self::handle_store(
						&inner,
						&association,
						&calling_aet,
						peer,
						message,
						receive_duration_ms,
					)
					.await?;
				}
				Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
					let response = CompositeEchoResponse {
						message_id: message.message_id(),
						status: STATUS_SUCCESS,
					};
					association
						.write_message(
							response,
							message.presentation_context_id,
							inner.config.operation_timeout(),
						)
						.await?;
				}
				other => {
					anyhow::bail!("Unsupported Command Field {other:?}; only C-STORE-RQ and C-ECHO-RQ are handled")
				}
			}
		}

		Ok(())
	}

	async fn handle_store(
		inner: &InnerStoreServiceClassProvider,
		association: &ServerAssociation,
		calling_aet: &str,
		peer: SocketAddr,
		message: DicomMessage,
		receive_duration_ms: i32,
	) -> anyhow::Result<()> {
		let message_id = message.message_id();
		let sop_class_uid = message
			.command_uid(tags::AFFECTED_SOP_CLASS_UID)
			.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?;
		let sop_instance_uid = message
			.command_uid(tags::AFFECTED_SOP_INSTANCE_UID)
			.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?;

		let status = match Self::store_instance(
			inner,
			association,
			calling_aet,
			peer,
			&message,
			&sop_class_uid,
			&sop_instance_uid,
			receive_duration_ms,
		)
		.await
		{
			Ok(()) => STATUS_SUCCESS,
			Err(err) => {
				inner.stats.record_failed();
				inner
					.events
					.submit(
						NewIngestEvent::failed(Some(sop_instance_uid.as_str()), &format!("{err:#}"))
							.with_peer(
								Some(calling_aet),
								&inner.config.aet,
								Some(&peer.ip().to_string()),
							),
					)
					.await;
				error!(
					sop_instance_uid = %sop_instance_uid,
					"C-STORE failed, answering processing failure: {err:#}"
				);
				STATUS_PROCESSING_FAILURE
			}
		};

		let response = CompositeStoreResponse {
			message_id,
			sop_class_uid: UI::from(sop_class_uid),
			sop_instance_uid: UI::from(sop_instance_uid),
			status,
		};
		association
			.write_message(
				response,
				message.presentation_context_id,
				inner.config.operation_timeout(),
			)
			.await?;
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn store_instance(
		inner: &InnerStoreServiceClassProvider,
		association: &ServerAssociation,
		calling_aet: &str,
		peer: SocketAddr,
		message: &DicomMessage,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		receive_duration_ms: i32,
	) -> anyhow::Result<()> {
		let payload = message
			.data
			.as_deref()
			.context("C-STORE-RQ without a data set")?;

		let presentation_context = association
			.presentation_contexts()
			.iter()
			.find(|pctx| Some(pctx.id) == message.presentation_context_id)
			.context("No presentation context for received data set")?;
		let transfer_syntax = presentation_context.transfer_syntax.as_str();

		let study_instance_uid = scan::find_study_instance_uid(payload, transfer_syntax)
			.context("Data set carries no StudyInstanceUID")?;

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid)
			.media_storage_sop_instance_uid(sop_instance_uid)
			.transfer_syntax(transfer_syntax)
			.build()
			.context("Failed to build file meta group")?;
		let file_bytes = compose_file(&meta, payload)?;
		let file_size = i64::try_from(file_bytes.len()).unwrap_or(i64::MAX);

		let storage_started = Instant::now();
		let file_path = inner
			.storage
			.write_instance(&study_instance_uid, sop_instance_uid, &file_bytes)
			.await?;
		let storage_duration_ms =
			i32::try_from(storage_started.elapsed().as_millis()).unwrap_or(i32::MAX);

		let job = ReceivedFileJob {
			file_path: file_path.display().to_string(),
			sop_instance_uid: String::from(sop_instance_uid),
			study_instance_uid: study_instance_uid.clone(),
			calling_ae_title: Some(String::from(calling_aet)),
			called_ae_title: inner.config.aet.clone(),
			receive_duration_ms,
			storage_duration_ms,
			file_size_bytes: file_size,
			received_at: Utc::now(),
		};
		inner
			.queue
			.enqueue(
				PROCESS_RECEIVED_FILE,
				&serde_json::to_value(&job)?,
				EnqueueOptions {
					max_attempts: inner.queue_config.max_attempts,
					..EnqueueOptions::default()
				},
			)
			.await
			.context("Failed to enqueue catalog job")?;

		inner.stats.record_stored(file_bytes.len() as u64);
		inner
			.events
			.submit(
				NewIngestEvent::received(sop_instance_uid)
					.with_peer(
						Some(calling_aet),
						&inner.config.aet,
						Some(&peer.ip().to_string()),
					)
					.with_timings(receive_duration_ms, storage_duration_ms, file_size),
			)
			.await;

		info!(
			sop_instance_uid,
			study_instance_uid = %study_instance_uid,
			size = file_size,
			receive_ms = receive_duration_ms,
			storage_ms = storage_duration_ms,
			"Received instance"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stats_counters_accumulate() {
		let stats = IngestStats::default();
		stats.record_stored(1000);
		stats.record_stored(24);
		stats.record_failed();

		assert_eq!(
			stats.snapshot(),
			IngestStatsSnapshot {
				received: 3,
				stored: 2,
				failed: 1,
				bytes_received: 1024,
			}
		);
	}
}
