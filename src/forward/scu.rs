//! Storage SCU: pushes the stored instances of a study to one destination
//! over a single client association.
//!
//! The C-STORE payload is the data set exactly as stored on disk; the
//! presentation context offered for each instance is its stored transfer
//! syntax plus the uncompressed fallbacks. An instance whose context the
//! destination refuses is counted as failed and the association continues
//! with the remaining instances.

use crate::db::models::DestinationRow;
use crate::dimse::association::client::{
	ClientAssociation, ClientAssociationOptions, ProposedContext,
};
use crate::dimse::association::{Association, AssociationError, NegotiatedContext};
use crate::dimse::cstore::CompositeStoreRequest;
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
};
use crate::storage::{split_file, StorageError};
use crate::types::{Priority, AE, UI, US};
use dicom::dictionary_std::uids;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Cannot resolve destination address {0}")]
	Resolve(String),
	#[error("Timed out connecting to destination")]
	ConnectTimeout,
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Storage(#[from] StorageError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
}

/// Preflight view of one on-disk instance.
#[derive(Debug, Clone)]
pub struct InstanceFile {
	pub path: PathBuf,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub transfer_syntax: UI,
}

#[derive(Debug, Default, Clone)]
pub struct TransferOutcome {
	pub instances_sent: i32,
	pub instances_failed: i32,
	pub bytes_sent: u64,
	pub failures: Vec<String>,
}

pub struct StoreServiceClassUser {
	calling_aet: AE,
}

impl StoreServiceClassUser {
	pub const fn new(calling_aet: AE) -> Self {
		Self { calling_aet }
	}

	/// Sends every file of a study to the destination. An association that
	/// drops mid-study is re-established once per execution; the transfer
	/// resumes with the instance that failed to send.
	#[instrument(skip_all, fields(destination = %destination.name))]
	pub async fn send_study(
		&self,
		destination: &DestinationRow,
		files: &[PathBuf],
	) -> Result<TransferOutcome, StoreError> {
		let mut outcome = TransferOutcome::default();

		let mut instances = Vec::with_capacity(files.len());
		for path in files {
			match preflight(path).await {
				Ok(instance) => instances.push(instance),
				Err(err) => {
					warn!(path = %path.display(), "Skipping unreadable instance: {err:#}");
					outcome.instances_failed += 1;
					outcome.failures.push(format!("{}: {err}", path.display()));
				}
			}
		}

		if instances.is_empty() {
			return Ok(outcome);
		}

		let contexts = propose_contexts(&instances);
		let timeout = destination_timeout(destination);

		let mut association = self.associate(destination, contexts.clone()).await?;
		let mut reassociated = false;

		for instance in &instances {
			let sent = loop {
				let Some(context) =
					pick_context(association.presentation_contexts(), instance)
				else {
					warn!(
						sop_instance_uid = %instance.sop_instance_uid,
						transfer_syntax = %instance.transfer_syntax,
						"Destination refused presentation context"
					);
					break false;
				};

				match self
					.send_instance(&association, context.id, instance, timeout)
					.await
				{
					Ok(result) => break result,
					Err(
						err @ (StoreError::Association(_)
						| StoreError::Read(_)
						| StoreError::Write(_)),
					) if !reassociated => {
						// One reconnection per job execution; a second drop
						// fails the whole job into the queue's retry policy.
						warn!(
							sop_instance_uid = %instance.sop_instance_uid,
							"Association dropped mid-study, re-associating: {err:#}"
						);
						reassociated = true;
						association = self.associate(destination, contexts.clone()).await?;
					}
					Err(err) => return Err(err),
				}
			};

			if sent {
				outcome.instances_sent += 1;
				outcome.bytes_sent += tokio::fs::metadata(&instance.path)
					.await
					.map(|meta| meta.len())
					.unwrap_or(0);
			} else {
				outcome.instances_failed += 1;
				outcome
					.failures
					.push(format!("{}: rejected", instance.sop_instance_uid));
			}
		}

		if let Err(err) = association.release(timeout).await {
			debug!("Association release failed: {err}");
		}

		info!(
			sent = outcome.instances_sent,
			failed = outcome.instances_failed,
			bytes = outcome.bytes_sent,
			"Study transfer finished"
		);
		Ok(outcome)
	}

	async fn associate(
		&self,
		destination: &DestinationRow,
		presentation_contexts: Vec<ProposedContext>,
	) -> Result<ClientAssociation, StoreError> {
		let address = resolve(destination).await?;
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: destination.ae_title.clone(),
			address,
			presentation_contexts,
			max_pdu_length: u32::try_from(destination.max_pdu).unwrap_or(16384),
		};

		let connect_timeout = Duration::from_secs(u64::try_from(destination.connection_timeout.max(1)).unwrap_or(10));
		tokio::time::timeout(connect_timeout, ClientAssociation::new(options))
			.await
			.map_err(|_| StoreError::ConnectTimeout)?
			.map_err(StoreError::Association)
	}

	/// Sends one C-STORE and waits for the response. `Ok(true)` means the
	/// destination acknowledged with a success status.
	async fn send_instance(
		&self,
		association: &ClientAssociation,
		presentation_context_id: u8,
		instance: &InstanceFile,
		timeout: Duration,
	) -> Result<bool, StoreError> {
		let bytes = tokio::fs::read(&instance.path).await?;
		let stored = split_file(&bytes)?;

		let request = CompositeStoreRequest {
			affected_sop_class_uid: instance.sop_class_uid.clone(),
			affected_sop_instance_uid: instance.sop_instance_uid.clone(),
			move_originator_aet: None,
			move_originator_message_id: None,
			message_id: next_message_id(),
			priority: Priority::Medium as US,
			data_set: stored.payload.to_vec(),
			presentation_context_id,
		};

		association.write_message(request, None, timeout).await?;
		let response = association.read_message(timeout).await?;

		let status = response.status().unwrap_or(0xC000);
		match StatusType::try_from(status).unwrap_or(StatusType::Failure) {
			StatusType::Success | StatusType::Warning => Ok(true),
			other => {
				warn!(
					sop_instance_uid = %instance.sop_instance_uid,
					status = %format!("{status:#06x}"),
					"C-STORE rejected ({other:?})"
				);
				Ok(false)
			}
		}
	}
}

async fn resolve(destination: &DestinationRow) -> Result<SocketAddr, StoreError> {
	let authority = format!("{}:{}", destination.host, destination.port);
	let mut addrs = tokio::net::lookup_host(&authority)
		.await
		.map_err(|_| StoreError::Resolve(authority.clone()))?;
	addrs.next().ok_or(StoreError::Resolve(authority.clone()))
}

const fn destination_timeout(destination: &DestinationRow) -> Duration {
	Duration::from_secs(destination.timeout.unsigned_abs() as u64)
}

/// Reads the file meta group of a stored file without touching the
/// payload.
async fn preflight(path: &Path) -> Result<InstanceFile, StoreError> {
	let bytes = tokio::fs::read(path).await?;
	let stored = split_file(&bytes)?;
	Ok(InstanceFile {
		path: path.to_path_buf(),
		sop_class_uid: UI::from(stored.sop_class_uid()),
		sop_instance_uid: UI::from(stored.sop_instance_uid()),
		transfer_syntax: UI::from(stored.transfer_syntax()),
	})
}

/// One proposed context per distinct SOP class: the stored transfer
/// syntaxes plus the uncompressed fallbacks mandated for compatibility.
pub fn propose_contexts(instances: &[InstanceFile]) -> Vec<ProposedContext> {
	let mut contexts: Vec<ProposedContext> = Vec::new();
	for instance in instances {
		match contexts
			.iter_mut()
			.find(|context| context.abstract_syntax == instance.sop_class_uid)
		{
			Some(context) => {
				if !context.transfer_syntaxes.contains(&instance.transfer_syntax) {
					context
						.transfer_syntaxes
						.insert(0, instance.transfer_syntax.clone());
				}
			}
			None => contexts.push(ProposedContext {
				abstract_syntax: instance.sop_class_uid.clone(),
				transfer_syntaxes: vec![instance.transfer_syntax.clone()],
			}),
		}
	}

	for context in &mut contexts {
		for fallback in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
			if !context.transfer_syntaxes.iter().any(|ts| ts == fallback) {
				context.transfer_syntaxes.push(UI::from(fallback));
			}
		}
	}

	contexts
}

/// Picks the negotiated context an instance can be sent through without
/// re-encoding: the transfer syntax must equal the stored one, and the
/// abstract syntax (when known) must match the instance's SOP class.
pub fn pick_context<'a>(
	negotiated: &'a [NegotiatedContext],
	instance: &InstanceFile,
) -> Option<&'a NegotiatedContext> {
	negotiated
		.iter()
		.find(|context| {
			context.transfer_syntax == instance.transfer_syntax
				&& context.abstract_syntax.as_deref() == Some(&instance.sop_class_uid)
		})
		.or_else(|| {
			negotiated
				.iter()
				.find(|context| {
					context.transfer_syntax == instance.transfer_syntax
						&& context.abstract_syntax.is_none()
				})
		})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn instance(sop_class: &str, ts: &str) -> InstanceFile {
		InstanceFile {
			path: PathBuf::from("/tmp/x.dcm"),
			sop_class_uid: UI::from(sop_class),
			sop_instance_uid: UI::from("1.2.3.4"),
			transfer_syntax: UI::from(ts),
		}
	}

	#[test]
	fn proposed_contexts_group_by_sop_class_with_fallbacks() {
		let instances = vec![
			instance("1.1", "1.2.840.10008.1.2.4.90"),
			instance("1.1", "1.2.840.10008.1.2.1"),
			instance("2.2", "1.2.840.10008.1.2"),
		];

		let contexts = propose_contexts(&instances);
		assert_eq!(contexts.len(), 2);

		let first = &contexts[0];
		assert_eq!(first.abstract_syntax, "1.1");
		assert!(first.transfer_syntaxes.contains(&UI::from("1.2.840.10008.1.2.4.90")));
		assert!(first
			.transfer_syntaxes
			.contains(&UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN)));
		assert!(first
			.transfer_syntaxes
			.contains(&UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)));

		// The implicit-VR instance's syntax is both its own and a fallback;
		// it must not be listed twice.
		let second = &contexts[1];
		assert_eq!(
			second
				.transfer_syntaxes
				.iter()
				.filter(|ts| *ts == uids::IMPLICIT_VR_LITTLE_ENDIAN)
				.count(),
			1
		);
	}

	#[test]
	fn context_picking_requires_exact_transfer_syntax() {
		let negotiated = vec![
			NegotiatedContext {
				id: 1,
				transfer_syntax: UI::from("1.2.840.10008.1.2.1"),
				abstract_syntax: Some(UI::from("1.1")),
			},
			NegotiatedContext {
				id: 3,
				transfer_syntax: UI::from("1.2.840.10008.1.2"),
				abstract_syntax: Some(UI::from("2.2")),
			},
		];

		let matched = pick_context(&negotiated, &instance("1.1", "1.2.840.10008.1.2.1"));
		assert_eq!(matched.map(|context| context.id), Some(1));

		// Stored syntax was not negotiated: the instance cannot be sent.
		assert!(pick_context(&negotiated, &instance("1.1", "1.2.840.10008.1.2.4.90")).is_none());
		// SOP class mismatch on a known abstract syntax.
		assert!(pick_context(&negotiated, &instance("9.9", "1.2.840.10008.1.2.1")).is_none());
	}

	#[test]
	fn context_picking_tolerates_unknown_abstract_syntax() {
		let negotiated = vec![NegotiatedContext {
			id: 5,
			transfer_syntax: UI::from("1.2.840.10008.1.2.1"),
			abstract_syntax: None,
		}];

		let matched = pick_context(&negotiated, &instance("1.1", "1.2.840.10008.1.2.1"));
		assert_eq!(matched.map(|context| context.id), Some(5));
	}

}
