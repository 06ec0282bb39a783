use crate::dimse::{DicomMessage, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RQ carrying the data set as pre-encoded bytes.
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	/// Data set bytes, already encoded in the transfer syntax of the
	/// presentation context the request is written to.
	pub data_set: Vec<u8>,
	pub presentation_context_id: u8,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
        let mut command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
        ]);

        if let Some(move_originator_message_id) = request.move_originator_message_id {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
        }

        if let Some(move_originator_aet) = request.move_originator_aet {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
        }

        Self {
            command,
            data: Some(request.data_set),
            presentation_context_id: Some(request.presentation_context_id),
        }
    }
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid))
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::{STATUS_PROCESSING_FAILURE, STATUS_SUCCESS};

	#[test]
	fn store_request_command_set() {
		let request = CompositeStoreRequest {
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.2"),
			affected_sop_instance_uid: UI::from("1.2.3.4"),
			move_originator_aet: None,
			move_originator_message_id: None,
			message_id: 7,
			priority: 0,
			data_set: vec![0x08, 0x00, 0x18, 0x00],
			presentation_context_id: 3,
		};

		let message = DicomMessage::from(request);
		assert_eq!(
			message.command_field(),
			Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST)
		);
		assert_eq!(message.message_id(), 7);
		assert_eq!(
			message.command_uid(tags::AFFECTED_SOP_INSTANCE_UID).as_deref(),
			Some("1.2.3.4")
		);
		assert_eq!(message.presentation_context_id, Some(3));
		assert_eq!(message.data.as_deref(), Some(&[0x08, 0x00, 0x18, 0x00][..]));
	}

	#[test]
	fn store_response_reports_status() {
		for status in [STATUS_SUCCESS, STATUS_PROCESSING_FAILURE] {
			let response = CompositeStoreResponse {
				message_id: 1,
				sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.4"),
				sop_instance_uid: UI::from("1.2.3.4.5"),
				status,
			};
			let message = DicomMessage::from(response);
			assert_eq!(
				message.command_field(),
				Some(COMMAND_FIELD_COMPOSITE_STORE_RESPONSE)
			);
			assert_eq!(message.status(), Some(status));
			assert!(message.data.is_none());
		}
	}
}
