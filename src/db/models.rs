use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Job and forward-job lifecycle states.
///
/// Stored as plain text in the database; the helpers below keep the SQL
/// literals in one place.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobStatus {
	Pending,
	Processing,
	Completed,
	Failed,
	DeadLetter,
}

impl JobStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Processing => "processing",
			Self::Completed => "completed",
			Self::Failed => "failed",
			Self::DeadLetter => "dead_letter",
		}
	}
}

impl std::str::FromStr for JobStatus {
	type Err = String;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"pending" => Ok(Self::Pending),
			"processing" => Ok(Self::Processing),
			"completed" => Ok(Self::Completed),
			"failed" => Ok(Self::Failed),
			"dead_letter" => Ok(Self::DeadLetter),
			other => Err(format!("unknown job status '{other}'")),
		}
	}
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StudyRow {
	pub id: Uuid,
	pub study_instance_uid: String,
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
	pub status: String,
	pub storage_path: Option<String>,
	pub file_count: i32,
	pub total_size_bytes: i64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub forwarded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DestinationRow {
	pub id: Uuid,
	pub name: String,
	pub ae_title: String,
	pub host: String,
	pub port: i32,
	pub max_pdu: i32,
	pub timeout: i32,
	pub connection_timeout: i32,
	pub tls_enabled: bool,
	pub tls_cert_path: Option<String>,
	pub tls_key_path: Option<String>,
	pub tls_ca_path: Option<String>,
	pub tls_no_verify: bool,
	pub enabled: bool,
	pub last_success_at: Option<DateTime<Utc>>,
	pub last_failure_at: Option<DateTime<Utc>>,
	pub consecutive_failures: i32,
	pub forwarding_rules: Option<serde_json::Value>,
	pub description: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
	pub id: Uuid,
	pub job_type: String,
	pub payload: serde_json::Value,
	pub status: String,
	pub priority: i32,
	pub attempts: i32,
	pub max_attempts: i32,
	pub available_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
	pub worker_id: Option<String>,
	pub locked_at: Option<DateTime<Utc>>,
	pub error_message: Option<String>,
	pub result: Option<serde_json::Value>,
	pub retry_after: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ForwardJobRow {
	pub id: Uuid,
	pub study_id: Uuid,
	pub destination_id: Uuid,
	pub status: String,
	pub priority: i32,
	pub attempts: i32,
	pub max_attempts: i32,
	pub available_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
	pub worker_id: Option<String>,
	pub locked_at: Option<DateTime<Utc>>,
	pub error_message: Option<String>,
	pub duration_ms: Option<i32>,
	pub instances_sent: i32,
	pub instances_failed: i32,
	pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn job_status_round_trip() {
		for status in [
			JobStatus::Pending,
			JobStatus::Processing,
			JobStatus::Completed,
			JobStatus::Failed,
			JobStatus::DeadLetter,
		] {
			assert_eq!(JobStatus::from_str(status.as_str()), Ok(status));
		}
		assert!(JobStatus::from_str("bogus").is_err());
	}
}
