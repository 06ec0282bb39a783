//! Byte-preserving storage tree.
//!
//! Instances live at `{root}/{study_uid}/{sop_instance_uid}.dcm`. Files
//! are framed as a standard DICOM Part 10 file: a 128-byte preamble, the
//! `DICM` prefix, the file meta group, and then the data set bytes exactly
//! as captured from the wire. The data set portion is never re-encoded.
//!
//! Writes are atomic with respect to readers: bytes go to a temporary
//! sibling under `{root}/incoming/` on the same device, are fsynced, and
//! are then renamed into place.

use dicom::object::meta::FileMetaTable;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PREAMBLE_SIZE: usize = 128;
pub const DICM_PREFIX: &[u8; 4] = b"DICM";

#[cfg(unix)]
const DIR_MODE: u32 = 0o750;
#[cfg(unix)]
const FILE_MODE: u32 = 0o640;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("Not a DICOM file: missing DICM prefix")]
	NotDicom,
	#[error("Invalid file meta group: {0}")]
	InvalidMeta(String),
	#[error("Study directory {0} does not exist")]
	MissingStudy(PathBuf),
}

/// A stored file split into its file meta group and the verbatim data set
/// payload.
pub struct StoredInstance<'a> {
	pub meta: FileMetaTable,
	pub payload: &'a [u8],
	pub has_preamble: bool,
}

impl StoredInstance<'_> {
	pub fn sop_class_uid(&self) -> &str {
		trim_uid(&self.meta.media_storage_sop_class_uid)
	}

	pub fn sop_instance_uid(&self) -> &str {
		trim_uid(&self.meta.media_storage_sop_instance_uid)
	}

	pub fn transfer_syntax(&self) -> &str {
		trim_uid(&self.meta.transfer_syntax)
	}
}

pub fn trim_uid(uid: &str) -> &str {
	uid.trim_end_matches('\0').trim()
}

/// Frames a captured data set as a Part 10 file: zeroed preamble, `DICM`,
/// file meta group, then the payload verbatim.
pub fn compose_file(meta: &FileMetaTable, payload: &[u8]) -> Result<Vec<u8>, StorageError> {
	let mut buffer = Vec::with_capacity(PREAMBLE_SIZE + 256 + payload.len());
	buffer.extend_from_slice(&[0u8; PREAMBLE_SIZE]);
	meta.write(&mut buffer)
		.map_err(|err| StorageError::InvalidMeta(err.to_string()))?;
	buffer.extend_from_slice(payload);
	Ok(buffer)
}

/// Splits a stored file back into its meta group and data set payload.
/// Accepts files without a preamble (non-standard but tolerated on read).
pub fn split_file(bytes: &[u8]) -> Result<StoredInstance<'_>, StorageError> {
	let (start, has_preamble) = if bytes.len() >= PREAMBLE_SIZE + DICM_PREFIX.len()
		&& &bytes[PREAMBLE_SIZE..PREAMBLE_SIZE + DICM_PREFIX.len()] == DICM_PREFIX
	{
		(PREAMBLE_SIZE, true)
	} else if bytes.len() >= DICM_PREFIX.len() && &bytes[..DICM_PREFIX.len()] == DICM_PREFIX {
		(0, false)
	} else {
		return Err(StorageError::NotDicom);
	};

	let mut cursor = Cursor::new(&bytes[start..]);
	let meta = FileMetaTable::from_reader(&mut cursor)
		.map_err(|err| StorageError::InvalidMeta(err.to_string()))?;
	let offset = start + usize::try_from(cursor.position()).unwrap_or(bytes.len());

	Ok(StoredInstance {
		meta,
		payload: &bytes[offset..],
		has_preamble,
	})
}

/// Checks for the `DICM` prefix. Returns whether the file carries the
/// 128-byte preamble, or `None` if the prefix is missing entirely.
pub fn dicom_magic(bytes: &[u8]) -> Option<bool> {
	if bytes.len() >= PREAMBLE_SIZE + DICM_PREFIX.len()
		&& &bytes[PREAMBLE_SIZE..PREAMBLE_SIZE + DICM_PREFIX.len()] == DICM_PREFIX
	{
		return Some(true);
	}
	if bytes.len() >= DICM_PREFIX.len() && &bytes[..DICM_PREFIX.len()] == DICM_PREFIX {
		return Some(false);
	}
	None
}

#[derive(Debug, Clone)]
pub struct StorageTree {
	root: PathBuf,
}

impl StorageTree {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn incoming_dir(&self) -> PathBuf {
		self.root.join("incoming")
	}

	pub fn study_dir(&self, study_instance_uid: &str) -> PathBuf {
		self.root.join(study_instance_uid)
	}

	pub fn instance_path(&self, study_instance_uid: &str, sop_instance_uid: &str) -> PathBuf {
		self.study_dir(study_instance_uid)
			.join(format!("{sop_instance_uid}.dcm"))
	}

	/// Creates the incoming staging directory. Called once at startup.
	pub async fn prepare(&self) -> Result<(), StorageError> {
		create_dir_restricted(&self.incoming_dir()).await?;
		Ok(())
	}

	/// Atomically writes an instance file and returns its final path.
	///
	/// The bytes are staged under `incoming/`, fsynced, and renamed into
	/// the study directory. A failed rename removes the staged file.
	pub async fn write_instance(
		&self,
		study_instance_uid: &str,
		sop_instance_uid: &str,
		bytes: &[u8],
	) -> Result<PathBuf, StorageError> {
		let final_path = self.instance_path(study_instance_uid, sop_instance_uid);
		let temp_path = self
			.incoming_dir()
			.join(format!("{sop_instance_uid}.{}.part", Uuid::new_v4()));

		create_dir_restricted(&self.study_dir(study_instance_uid)).await?;

		let mut file = tokio::fs::File::create(&temp_path).await?;
		file.write_all(bytes).await?;
		file.sync_all().await?;
		drop(file);

		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(FILE_MODE))
				.await?;
		}

		if let Err(err) = tokio::fs::rename(&temp_path, &final_path).await {
			if let Err(cleanup_err) = tokio::fs::remove_file(&temp_path).await {
				warn!(
					path = %temp_path.display(),
					"Failed to remove staged file after rename failure: {cleanup_err}"
				);
			}
			return Err(err.into());
		}

		debug!(path = %final_path.display(), size = bytes.len(), "Stored instance");
		Ok(final_path)
	}

	/// Lists the `.dcm` files of a study in name order.
	pub async fn study_files(
		&self,
		study_instance_uid: &str,
	) -> Result<Vec<PathBuf>, StorageError> {
		let dir = self.study_dir(study_instance_uid);
		if !dir.is_dir() {
			return Err(StorageError::MissingStudy(dir));
		}

		let mut files = Vec::new();
		let mut entries = tokio::fs::read_dir(&dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if path.extension().is_some_and(|ext| ext == "dcm") {
				files.push(path);
			}
		}
		files.sort();
		Ok(files)
	}
}

async fn create_dir_restricted(dir: &Path) -> Result<(), StorageError> {
	if dir.is_dir() {
		return Ok(());
	}
	tokio::fs::create_dir_all(dir).await?;

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE)).await?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::FileMetaTableBuilder;

	fn test_meta() -> FileMetaTable {
		FileMetaTableBuilder::new()
			.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
			.media_storage_sop_instance_uid("1.2.3.4")
			.transfer_syntax("1.2.840.10008.1.2.1")
			.build()
			.unwrap()
	}

	#[test]
	fn compose_then_split_round_trips_payload() {
		let payload: Vec<u8> = (0..=255).cycle().take(4096).map(|b: u16| b as u8).collect();
		let composed = compose_file(&test_meta(), &payload).unwrap();

		assert_eq!(&composed[..PREAMBLE_SIZE], &[0u8; PREAMBLE_SIZE]);
		assert_eq!(&composed[PREAMBLE_SIZE..PREAMBLE_SIZE + 4], DICM_PREFIX);

		let split = split_file(&composed).unwrap();
		assert!(split.has_preamble);
		assert_eq!(split.payload, payload.as_slice());
		assert_eq!(split.sop_instance_uid(), "1.2.3.4");
		assert_eq!(split.transfer_syntax(), "1.2.840.10008.1.2.1");
	}

	#[test]
	fn magic_detection() {
		let mut with_preamble = vec![0u8; PREAMBLE_SIZE];
		with_preamble.extend_from_slice(DICM_PREFIX);
		assert_eq!(dicom_magic(&with_preamble), Some(true));

		assert_eq!(dicom_magic(b"DICMxxxx"), Some(false));
		assert_eq!(dicom_magic(b"NOPE"), None);
		assert_eq!(dicom_magic(&[0u8; 200]), None);
	}

	#[test]
	fn instance_paths_follow_study_layout() {
		let tree = StorageTree::new("/var/lib/dicom-gw");
		assert_eq!(
			tree.instance_path("1.2.3", "1.2.3.4"),
			PathBuf::from("/var/lib/dicom-gw/1.2.3/1.2.3.4.dcm")
		);
		assert_eq!(
			tree.incoming_dir(),
			PathBuf::from("/var/lib/dicom-gw/incoming")
		);
	}

	#[tokio::test]
	async fn write_instance_is_atomic_and_listable() {
		let dir = tempfile::tempdir().unwrap();
		let tree = StorageTree::new(dir.path());
		tree.prepare().await.unwrap();

		let composed = compose_file(&test_meta(), &[1, 2, 3, 4]).unwrap();
		let path = tree.write_instance("1.2.3", "1.2.3.4", &composed).await.unwrap();

		assert_eq!(path, tree.instance_path("1.2.3", "1.2.3.4"));
		assert_eq!(tokio::fs::read(&path).await.unwrap(), composed);

		// The staging area holds no leftovers.
		let mut staged = tokio::fs::read_dir(tree.incoming_dir()).await.unwrap();
		assert!(staged.next_entry().await.unwrap().is_none());

		let files = tree.study_files("1.2.3").await.unwrap();
		assert_eq!(files, vec![path]);

		assert!(matches!(
			tree.study_files("9.9.9").await,
			Err(StorageError::MissingStudy(_))
		));
	}
}
