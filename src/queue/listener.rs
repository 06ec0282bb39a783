//! Wake-up signal for queue workers.
//!
//! Subscribes to the LISTEN/NOTIFY channels posted by [`super::JobQueue`]
//! and degrades to pure polling when the subscription cannot be
//! established. A periodic tick fires in both modes so that a missed
//! notification can only ever delay a job by one poll interval.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::job_channel;

/// Receiver half of the wake-up signal. Wake-ups are coalesced: any number
/// of pending notifications collapse into a single recv.
pub struct JobSignal {
	rx: mpsc::Receiver<()>,
}

impl JobSignal {
	/// Waits for the next wake-up (notification or poll tick).
	pub async fn recv(&mut self) {
		// None means the listener task stopped; callers keep polling on
		// their own interval in that case.
		let _ = self.rx.recv().await;
	}

	/// Subscribes to the channel for `job_type` (or the catch-all channel)
	/// plus a poll tick every `poll_interval`.
	pub fn subscribe(pool: PgPool, job_type: Option<&str>, poll_interval: Duration) -> Self {
		let channel = job_channel(job_type);
		let (tx, rx) = mpsc::channel(1);

		tokio::spawn(async move {
			loop {
				match listen_loop(&pool, &channel, poll_interval, &tx).await {
					Ok(()) => break,
					Err(err) => {
						warn!(
							channel = %channel,
							"Job notification subscription failed, polling instead: {err}"
						);
						if poll_loop(poll_interval, &tx).await.is_err() {
							break;
						}
						// Receiver still alive after the poll backoff window;
						// try to re-establish the subscription.
					}
				}
			}
			debug!(channel = %channel, "Job signal task stopped");
		});

		Self { rx }
	}
}

async fn listen_loop(
	pool: &PgPool,
	channel: &str,
	poll_interval: Duration,
	tx: &mpsc::Sender<()>,
) -> Result<(), sqlx::Error> {
	let mut listener = PgListener::connect_with(pool).await?;
	listener.listen(channel).await?;
	info!(channel = %channel, "Listening for job notifications");

	loop {
		let wake = tokio::select! {
			notification = listener.recv() => {
				notification?;
				true
			}
			() = tokio::time::sleep(poll_interval) => true,
		};

		if wake && wake_receiver(tx) {
			return Ok(());
		}
	}
}

/// Fallback polling for one backoff window (12 intervals) before the
/// subscription is retried.
async fn poll_loop(poll_interval: Duration, tx: &mpsc::Sender<()>) -> Result<(), ()> {
	for _ in 0..12 {
		tokio::time::sleep(poll_interval).await;
		if wake_receiver(tx) {
			return Err(());
		}
	}
	Ok(())
}

/// Returns true when the receiving worker is gone.
fn wake_receiver(tx: &mpsc::Sender<()>) -> bool {
	matches!(tx.try_send(()), Err(mpsc::error::TrySendError::Closed(())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn wake_coalesces_and_detects_closed_receiver() {
		let (tx, mut rx) = mpsc::channel(1);

		assert!(!wake_receiver(&tx));
		// Channel full: the wake-up coalesces instead of blocking.
		assert!(!wake_receiver(&tx));
		assert!(rx.recv().await.is_some());

		drop(rx);
		assert!(wake_receiver(&tx));
	}
}
