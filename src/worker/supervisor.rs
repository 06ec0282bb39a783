//! Worker lifecycle as an external capability.
//!
//! The autoscaler only ever talks to this trait; anything that can count,
//! start and stop worker instances (a process supervisor, a container
//! orchestrator) can stand behind it. The shipped implementation drives
//! systemd templated units (`{prefix}-{kind}-worker@{id}.service`).

use crate::types::WorkerKind;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
	#[error("Failed to invoke supervisor: {0}")]
	Invoke(#[from] std::io::Error),
	#[error("Supervisor command failed: {0}")]
	Command(String),
}

#[async_trait]
pub trait Supervisor: Send + Sync {
	/// Number of currently running instances of a worker type.
	async fn list_instances(&self, kind: WorkerKind) -> Result<usize, SupervisorError>;

	async fn start_instance(&self, kind: WorkerKind, id: usize) -> Result<(), SupervisorError>;

	async fn stop_instance(&self, kind: WorkerKind, id: usize) -> Result<(), SupervisorError>;
}

pub struct SystemdSupervisor {
	unit_prefix: String,
}

impl SystemdSupervisor {
	pub const fn new(unit_prefix: String) -> Self {
		Self { unit_prefix }
	}

	fn unit_name(&self, kind: WorkerKind, id: usize) -> String {
		format!("{}-{kind}-worker@{id}.service", self.unit_prefix)
	}

	fn unit_pattern(&self, kind: WorkerKind) -> String {
		format!("{}-{kind}-worker@", self.unit_prefix)
	}
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
	async fn list_instances(&self, kind: WorkerKind) -> Result<usize, SupervisorError> {
		let pattern = self.unit_pattern(kind);
		let output = Command::new("systemctl")
			.args([
				"list-units",
				"--type=service",
				"--state=running",
				"--no-pager",
				"--no-legend",
				&format!("{pattern}*"),
			])
			.output()
			.await?;

		if !output.status.success() {
			return Err(SupervisorError::Command(
				String::from_utf8_lossy(&output.stderr).into_owned(),
			));
		}

		let count = String::from_utf8_lossy(&output.stdout)
			.lines()
			.filter(|line| line.contains(&pattern))
			.count();
		Ok(count)
	}

	async fn start_instance(&self, kind: WorkerKind, id: usize) -> Result<(), SupervisorError> {
		let unit = self.unit_name(kind, id);
		debug!(unit = %unit, "Starting worker instance");
		run_systemctl(&["start", &unit]).await
	}

	async fn stop_instance(&self, kind: WorkerKind, id: usize) -> Result<(), SupervisorError> {
		let unit = self.unit_name(kind, id);
		debug!(unit = %unit, "Stopping worker instance");
		run_systemctl(&["stop", &unit]).await
	}
}

async fn run_systemctl(args: &[&str]) -> Result<(), SupervisorError> {
	let output = Command::new("systemctl").args(args).output().await?;
	if output.status.success() {
		Ok(())
	} else {
		let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
		warn!("systemctl {args:?} failed: {stderr}");
		Err(SupervisorError::Command(stderr))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unit_names_follow_template() {
		let supervisor = SystemdSupervisor::new(String::from("dicom-gw"));
		assert_eq!(
			supervisor.unit_name(WorkerKind::Forward, 3),
			"dicom-gw-forward-worker@3.service"
		);
		assert_eq!(
			supervisor.unit_pattern(WorkerKind::Catalog),
			"dicom-gw-catalog-worker@"
		);
	}
}
