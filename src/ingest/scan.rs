//! Minimal top-level scan over a captured data set.
//!
//! The receive path only needs `StudyInstanceUID` to place the file in the
//! storage tree; everything else is extracted later by the catalog writer
//! from the stored file. The scanner walks top-level data elements of a
//! little-endian stream until it reaches the wanted tag or passes its
//! group, without building a tag tree.

use dicom::dictionary_std::uids;

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

/// Explicit VR Big Endian (retired), the one standard syntax the scanner
/// does not read.
const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Tag of StudyInstanceUID (0020,000D).
const STUDY_INSTANCE_UID: (u16, u16) = (0x0020, 0x000D);

/// Extracts `StudyInstanceUID` from an encoded data set.
///
/// Supports implicit and explicit VR little endian, which covers every
/// standard transfer syntax (compressed syntaxes encode their data sets as
/// explicit VR little endian). Returns `None` for big-endian streams or
/// when the element cannot be located before its group has passed.
pub fn find_study_instance_uid(payload: &[u8], transfer_syntax_uid: &str) -> Option<String> {
	if transfer_syntax_uid == EXPLICIT_VR_BIG_ENDIAN {
		return None;
	}
	let explicit_vr = transfer_syntax_uid != uids::IMPLICIT_VR_LITTLE_ENDIAN;

	let mut offset = 0usize;
	loop {
		let (group, element) = (
			read_u16(payload, offset)?,
			read_u16(payload, offset.checked_add(2)?)?,
		);
		offset = offset.checked_add(4)?;

		let length = if explicit_vr {
			let vr = [*payload.get(offset)?, *payload.get(offset + 1)?];
			offset += 2;
			if has_long_length(vr) {
				offset += 2; // reserved
				let length = read_u32(payload, offset)?;
				offset += 4;
				length
			} else {
				let length = u32::from(read_u16(payload, offset)?);
				offset += 2;
				length
			}
		} else {
			let length = read_u32(payload, offset)?;
			offset += 4;
			length
		};

		if (group, element) == STUDY_INSTANCE_UID {
			let length = usize::try_from(length).ok()?;
			let value = payload.get(offset..offset.checked_add(length)?)?;
			let uid = String::from_utf8_lossy(value)
				.trim_end_matches('\0')
				.trim()
				.to_string();
			return (!uid.is_empty()).then_some(uid);
		}

		// Elements are sorted by tag; past group 0020 the UID cannot follow.
		if group > STUDY_INSTANCE_UID.0 {
			return None;
		}

		if length == UNDEFINED_LENGTH {
			// Undefined-length sequence before the study module; give up and
			// let the catalog writer do the full parse.
			return None;
		}

		offset = offset.checked_add(usize::try_from(length).ok()?)?;
	}
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
	let slice = bytes.get(offset..offset.checked_add(2)?)?;
	Some(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
	let slice = bytes.get(offset..offset.checked_add(4)?)?;
	Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// VRs that use the 12-byte explicit header with a 32-bit length.
fn has_long_length(vr: [u8; 2]) -> bool {
	matches!(
		&vr,
		b"OB" | b"OD" | b"OF" | b"OL" | b"OV" | b"OW" | b"SQ" | b"UC" | b"UR" | b"UT" | b"UN"
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn explicit_element(group: u16, element: u16, vr: &[u8; 2], value: &[u8]) -> Vec<u8> {
		let mut out = Vec::new();
		out.extend_from_slice(&group.to_le_bytes());
		out.extend_from_slice(&element.to_le_bytes());
		out.extend_from_slice(vr);
		if has_long_length(*vr) {
			out.extend_from_slice(&[0, 0]);
			out.extend_from_slice(&u32::try_from(value.len()).unwrap().to_le_bytes());
		} else {
			out.extend_from_slice(&u16::try_from(value.len()).unwrap().to_le_bytes());
		}
		out.extend_from_slice(value);
		out
	}

	fn implicit_element(group: u16, element: u16, value: &[u8]) -> Vec<u8> {
		let mut out = Vec::new();
		out.extend_from_slice(&group.to_le_bytes());
		out.extend_from_slice(&element.to_le_bytes());
		out.extend_from_slice(&u32::try_from(value.len()).unwrap().to_le_bytes());
		out.extend_from_slice(value);
		out
	}

	#[test]
	fn finds_uid_in_explicit_vr_stream() {
		let mut payload = Vec::new();
		payload.extend(explicit_element(0x0008, 0x0016, b"UI", b"1.2.840.10008.5.1.4.1.1.2\0"));
		payload.extend(explicit_element(0x0008, 0x0018, b"UI", b"1.2.3.4\0"));
		payload.extend(explicit_element(0x0010, 0x0010, b"PN", b"DOE^JANE"));
		payload.extend(explicit_element(0x0020, 0x000D, b"UI", b"1.2.3\0"));
		payload.extend(explicit_element(0x0020, 0x000E, b"UI", b"1.2.3.9\0"));

		assert_eq!(
			find_study_instance_uid(&payload, "1.2.840.10008.1.2.1").as_deref(),
			Some("1.2.3")
		);
	}

	#[test]
	fn finds_uid_in_implicit_vr_stream() {
		let mut payload = Vec::new();
		payload.extend(implicit_element(0x0008, 0x0018, b"1.2.3.4\0"));
		payload.extend(implicit_element(0x0020, 0x000D, b"9.8.7.6\0"));

		assert_eq!(
			find_study_instance_uid(&payload, "1.2.840.10008.1.2").as_deref(),
			Some("9.8.7.6")
		);
	}

	#[test]
	fn skips_long_header_elements() {
		let mut payload = Vec::new();
		payload.extend(explicit_element(0x0008, 0x0000, b"UN", &[0xAA; 64]));
		payload.extend(explicit_element(0x0020, 0x000D, b"UI", b"1.2.3"));

		assert_eq!(
			find_study_instance_uid(&payload, "1.2.840.10008.1.2.1").as_deref(),
			Some("1.2.3")
		);
	}

	#[test]
	fn gives_up_past_the_study_group() {
		let payload = explicit_element(0x0028, 0x0010, b"US", &[0, 2]);
		assert_eq!(find_study_instance_uid(&payload, "1.2.840.10008.1.2.1"), None);
	}

	#[test]
	fn gives_up_on_undefined_length_and_truncation() {
		let mut sequence = Vec::new();
		sequence.extend_from_slice(&0x0008u16.to_le_bytes());
		sequence.extend_from_slice(&0x1140u16.to_le_bytes());
		sequence.extend_from_slice(b"SQ");
		sequence.extend_from_slice(&[0, 0]);
		sequence.extend_from_slice(&UNDEFINED_LENGTH.to_le_bytes());
		assert_eq!(find_study_instance_uid(&sequence, "1.2.840.10008.1.2.1"), None);

		let truncated = &explicit_element(0x0020, 0x000D, b"UI", b"1.2.3")[..6];
		assert_eq!(find_study_instance_uid(truncated, "1.2.840.10008.1.2.1"), None);
	}

	#[test]
	fn rejects_big_endian() {
		let payload = implicit_element(0x0020, 0x000D, b"1.2.3");
		assert_eq!(find_study_instance_uid(&payload, "1.2.840.10008.1.2.2"), None);
	}
}
