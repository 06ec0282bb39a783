use crate::dimse::{DicomMessage, DATA_SET_MISSING};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

/// C-ECHO-RSP. The listen side answers Verification requests so that
/// upstream modalities can probe the gateway.
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub message_id: US,
	pub status: US,
}

impl From<CompositeEchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeEchoResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
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
	use crate::dimse::STATUS_SUCCESS;

	#[test]
	fn echo_response_has_no_data_set() {
		let message = DicomMessage::from(CompositeEchoResponse {
			message_id: 42,
			status: STATUS_SUCCESS,
		});
		assert_eq!(
			message.command_field(),
			Some(COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE)
		);
		assert_eq!(message.status(), Some(STATUS_SUCCESS));
		assert!(message.data.is_none());
	}
}
