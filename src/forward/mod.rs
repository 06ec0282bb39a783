//! Forwarding: dispatch planning, the Storage SCU and the forward worker.
//!
//! `trigger_forward` jobs fan a study out into one `ForwardJob` row per
//! matching destination. Forward workers then claim those rows and push
//! the study's instances over a client association, preserving the stored
//! bytes.

pub mod scu;
pub mod worker;

use crate::db::models::StudyRow;
use crate::queue::{ClaimedJob, QueueError};
use crate::worker::JobHandler;
use chrono::{NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const TRIGGER_FORWARD: &str = "trigger_forward";

/// Payload of a `trigger_forward` job. Without an explicit destination
/// list, all enabled destinations are considered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerForwardJob {
	pub study_instance_uid: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub destination_ids: Option<Vec<Uuid>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub priority: Option<i32>,
}

#[derive(Debug, Error)]
pub enum PlanError {
	#[error("Invalid job payload: {0}")]
	Payload(#[from] serde_json::Error),
	#[error("Study not found: {0}")]
	UnknownStudy(String),
	#[error(transparent)]
	Database(#[from] sqlx::Error),
	#[error(transparent)]
	Queue(#[from] QueueError),
}

/// Per-destination forwarding predicate, stored as JSON on the
/// destination row. Absent filters match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardingRules {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub modalities: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub calling_aets: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub time_window: Option<TimeWindow>,
}

/// Local-time window in which forwarding to a destination is allowed.
/// Windows may wrap midnight (e.g. 20:00 to 06:00).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
	#[serde(deserialize_with = "deserialize_time", serialize_with = "serialize_time")]
	pub start: NaiveTime,
	#[serde(deserialize_with = "deserialize_time", serialize_with = "serialize_time")]
	pub end: NaiveTime,
}

impl TimeWindow {
	pub fn contains(&self, time: NaiveTime) -> bool {
		if self.start <= self.end {
			self.start <= time && time < self.end
		} else {
			time >= self.start || time < self.end
		}
	}
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;
	NaiveTime::parse_from_str(&value, "%H:%M")
		.or_else(|_| NaiveTime::parse_from_str(&value, "%H:%M:%S"))
		.map_err(|_| serde::de::Error::custom(format!("invalid time of day '{value}'")))
}

fn serialize_time<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
where
	S: serde::Serializer,
{
	serializer.serialize_str(&format!("{:02}:{:02}", time.hour(), time.minute()))
}

impl ForwardingRules {
	/// Evaluates the predicate against a study's modality, the AE title
	/// that sent it, and the current time of day.
	pub fn matches(
		&self,
		modality: Option<&str>,
		calling_aet: Option<&str>,
		now: NaiveTime,
	) -> bool {
		if let Some(modalities) = &self.modalities {
			let Some(modality) = modality else {
				return false;
			};
			if !modalities.iter().any(|allowed| allowed == modality) {
				return false;
			}
		}

		if let Some(calling_aets) = &self.calling_aets {
			let Some(calling_aet) = calling_aet else {
				return false;
			};
			if !calling_aets.iter().any(|allowed| allowed == calling_aet) {
				return false;
			}
		}

		if let Some(window) = &self.time_window {
			if !window.contains(now) {
				return false;
			}
		}

		true
	}
}

/// Executes `trigger_forward` jobs: enumerates target destinations,
/// evaluates their rules and inserts one pending `ForwardJob` per match.
pub struct DispatchPlanner {
	pool: PgPool,
	max_attempts: i32,
}

impl DispatchPlanner {
	pub const fn new(pool: PgPool, max_attempts: i32) -> Self {
		Self { pool, max_attempts }
	}

	#[instrument(skip_all, fields(study_instance_uid = %trigger.study_instance_uid))]
	pub async fn plan(
		&self,
		trigger: &TriggerForwardJob,
		priority: i32,
	) -> Result<serde_json::Value, PlanError> {
		let study = sqlx::query_as::<_, StudyRow>(
			"SELECT * FROM studies WHERE study_instance_uid = $1",
		)
		.bind(&trigger.study_instance_uid)
		.fetch_optional(&self.pool)
		.await?;

		let Some(study) = study else {
			return Err(PlanError::UnknownStudy(trigger.study_instance_uid.clone()));
		};

		let destinations: Vec<(Uuid, String, Option<serde_json::Value>)> =
			if let Some(ids) = &trigger.destination_ids {
				sqlx::query_as(
					"SELECT id, name, forwarding_rules FROM destinations \
					 WHERE enabled AND id = ANY($1)",
				)
				.bind(ids)
				.fetch_all(&self.pool)
				.await?
			} else {
				sqlx::query_as(
					"SELECT id, name, forwarding_rules FROM destinations WHERE enabled",
				)
				.fetch_all(&self.pool)
				.await?
			};

		let calling_aet: Option<(String,)> = sqlx::query_as(
			"SELECT calling_ae_title FROM ingest_events \
			 WHERE study_id = $1 AND calling_ae_title IS NOT NULL \
			 ORDER BY created_at DESC LIMIT 1",
		)
		.bind(study.id)
		.fetch_optional(&self.pool)
		.await?;
		let calling_aet = calling_aet.map(|(aet,)| aet);

		let priority = trigger.priority.unwrap_or(priority);
		let now = Utc::now().time();
		let mut forward_job_ids = Vec::new();

		for (destination_id, name, rules) in destinations {
			let matched = match rules {
				None => true,
				Some(rules) => match serde_json::from_value::<ForwardingRules>(rules) {
					Ok(rules) => {
						rules.matches(study.modality.as_deref(), calling_aet.as_deref(), now)
					}
					Err(err) => {
						// A malformed predicate never matches.
						warn!(destination = %name, "Unreadable forwarding rules: {err}");
						false
					}
				},
			};

			if !matched {
				debug!(destination = %name, "Destination filtered out by rules");
				continue;
			}

			let id = Uuid::new_v4();
			sqlx::query(
				"INSERT INTO forward_jobs (id, study_id, destination_id, status, priority, max_attempts) \
				 VALUES ($1, $2, $3, 'pending', $4, $5)",
			)
			.bind(id)
			.bind(study.id)
			.bind(destination_id)
			.bind(priority)
			.bind(self.max_attempts)
			.execute(&self.pool)
			.await?;

			info!(destination = %name, forward_job_id = %id, "Planned forward job");
			forward_job_ids.push(id);
		}

		Ok(serde_json::json!({
			"study_instance_uid": trigger.study_instance_uid,
			"forward_job_ids": forward_job_ids,
			"created_at": Utc::now(),
		}))
	}
}

#[async_trait::async_trait]
impl JobHandler for DispatchPlanner {
	fn job_type(&self) -> &'static str {
		TRIGGER_FORWARD
	}

	async fn run(&self, job: &ClaimedJob) -> Result<serde_json::Value, anyhow::Error> {
		let trigger: TriggerForwardJob =
			serde_json::from_value(job.payload.clone()).map_err(PlanError::Payload)?;
		Ok(self.plan(&trigger, job.priority).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn time(hour: u32, minute: u32) -> NaiveTime {
		NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
	}

	#[test]
	fn empty_rules_match_everything() {
		let rules = ForwardingRules::default();
		assert!(rules.matches(None, None, time(3, 0)));
		assert!(rules.matches(Some("CT"), Some("ANY"), time(12, 0)));
	}

	#[test]
	fn modality_filter() {
		let rules = ForwardingRules {
			modalities: Some(vec![String::from("CT"), String::from("MR")]),
			..ForwardingRules::default()
		};
		assert!(rules.matches(Some("CT"), None, time(9, 0)));
		assert!(!rules.matches(Some("US"), None, time(9, 0)));
		assert!(!rules.matches(None, None, time(9, 0)));
	}

	#[test]
	fn calling_aet_filter() {
		let rules = ForwardingRules {
			calling_aets: Some(vec![String::from("MOD1")]),
			..ForwardingRules::default()
		};
		assert!(rules.matches(None, Some("MOD1"), time(9, 0)));
		assert!(!rules.matches(None, Some("MOD2"), time(9, 0)));
		assert!(!rules.matches(None, None, time(9, 0)));
	}

	#[test]
	fn time_window_with_and_without_midnight_wrap() {
		let day = TimeWindow {
			start: time(8, 0),
			end: time(20, 0),
		};
		assert!(day.contains(time(8, 0)));
		assert!(day.contains(time(12, 30)));
		assert!(!day.contains(time(20, 0)));
		assert!(!day.contains(time(3, 0)));

		let night = TimeWindow {
			start: time(20, 0),
			end: time(6, 0),
		};
		assert!(night.contains(time(23, 0)));
		assert!(night.contains(time(3, 0)));
		assert!(!night.contains(time(12, 0)));
	}

	#[test]
	fn rules_parse_from_destination_json() {
		let rules: ForwardingRules = serde_json::from_value(serde_json::json!({
			"modalities": ["CT"],
			"time_window": {"start": "08:00", "end": "20:00"}
		}))
		.unwrap();

		assert!(rules.matches(Some("CT"), None, time(10, 0)));
		assert!(!rules.matches(Some("CT"), None, time(22, 0)));

		assert!(serde_json::from_value::<ForwardingRules>(
			serde_json::json!({"time_window": {"start": "late", "end": "06:00"}})
		)
		.is_err());
	}
}
