use dicom::ul::pdu::{PDataValueType, Pdu};
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command, NegotiatedContext};
use crate::types::{AE, UI};

/// Requesting side of a DICOM association, used to push studies to
/// downstream Application Entities.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<NegotiatedContext>,
	acceptor_max_pdu_length: u32,
}

/// A presentation context to propose: one abstract syntax with the
/// transfer syntaxes offered for it.
#[derive(Debug, Clone)]
pub struct ProposedContext {
	pub abstract_syntax: UI,
	pub transfer_syntaxes: Vec<UI>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub address: SocketAddr,
	pub presentation_contexts: Vec<ProposedContext>,
	pub max_pdu_length: u32,
}

impl ClientAssociation {
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				if is_command {
					association.send(pdu).map_err(AssociationError::Association)
				} else {
					let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
					if data_length > association.acceptor_max_pdu_length() as usize {
						for pdv in data {
							let mut writer = association.send_pdata(pdv.presentation_context_id);
							writer
								.write_all(&pdv.data)
								.map_err(AssociationError::ChunkWriter)?;
						}
						Ok(())
					} else {
						association.send(pdu).map_err(AssociationError::Association)
					}
				}
			}
			_ => association.send(pdu).map_err(AssociationError::Association),
		}
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let proposed = options.presentation_contexts.clone();
		let mut client_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.max_pdu_length(options.max_pdu_length);

		for context in options.presentation_contexts {
			client_options = client_options.with_presentation_context(
				context.abstract_syntax,
				context.transfer_syntaxes,
			);
		}

		let _handle = thread::Builder::new()
			.name(format!("storescu-{uuid}"))
			.spawn(move || {
				let mut association = match client_options.establish(address) {
					Ok(mut association) => {
						// Proposed contexts are assigned the odd ids 1, 3, 5, ...
						// in proposal order; join the acceptor's results back to
						// the abstract syntax we proposed them for.
						let presentation_contexts: Vec<NegotiatedContext> = association
							.presentation_contexts()
							.iter()
							.map(|pctx| NegotiatedContext {
								id: pctx.id,
								transfer_syntax: String::from(
									pctx.transfer_syntax.trim_end_matches('\0'),
								),
								abstract_syntax: proposed
									.get((pctx.id as usize).saturating_sub(1) / 2)
									.map(|context| context.abstract_syntax.clone()),
							})
							.collect();
						let acceptor_max_pdu_length = association.acceptor_max_pdu_length();

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream should be cloneable");

						connect_tx
							.send(Ok((stream, presentation_contexts, acceptor_max_pdu_length)))
							.map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				let mut released = false;
				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							released = true;
							let _ = reply_to.send(Ok(())).map_err(|_| ChannelError::Closed);
							break;
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in ClientAssociation backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				if released {
					if let Err(err) = association.release() {
						debug!(
							backend_uuid = uuid.to_string(),
							"Failed to release ClientAssociation: {err}"
						);
					}
				} else if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, acceptor_max_pdu_length) =
			connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
			acceptor_max_pdu_length,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	pub const fn acceptor_max_pdu_length(&self) -> u32 {
		self.acceptor_max_pdu_length
	}

	/// Performs the release handshake and stops the backing thread.
	pub async fn release(&self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[NegotiatedContext] {
		&self.presentation_contexts
	}
}
