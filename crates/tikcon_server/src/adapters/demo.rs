#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use tikcon_domain::{Viewer, ViewerId};
use tikcon_platform::{
	ConnectionInfo, GiftNotification, NotificationTx, RawNotification, StreamConnection, StreamCredentials,
	StreamTransport, TransportError, new_session_id,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const DEMO_VIEWERS: [(&str, &str); 3] = [("demo-1", "DemoAlice"), ("demo-2", "DemoBob"), ("demo-3", "DemoCarol")];

/// Combo re-emissions per demo gift burst; the last one carries `repeat_end`.
const DEMO_COMBO: [u32; 4] = [1, 3, 3, 5];

/// Dev-only stream emitting synthetic gifts, likes and subscriptions.
#[derive(Debug, Clone)]
pub struct DemoStream {
	emit_interval: Duration,
}

impl DemoStream {
	pub fn new() -> Self {
		Self {
			emit_interval: Duration::from_millis(750),
		}
	}

	/// Customize emit interval (useful for tests).
	#[cfg(test)]
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}

	fn viewer(tick: u64) -> Viewer {
		let (id, name) = DEMO_VIEWERS[(tick / 8) as usize % DEMO_VIEWERS.len()];
		match ViewerId::new(id) {
			Ok(id) => Viewer::new(id, name),
			Err(_) => Viewer::manual(),
		}
	}

	/// Notification for `tick`: a four-step Rose combo, a like burst, a
	/// subscription, then two more like bursts.
	fn make_notification(tick: u64, session_id: &str) -> RawNotification {
		let viewer = Self::viewer(tick);
		let step = tick % 8;
		match step {
			0..=3 => {
				let repeat_count = DEMO_COMBO[step as usize];
				RawNotification::Gift(GiftNotification {
					viewer,
					gift_id: 5655,
					gift_name: "Rose".to_string(),
					combo: true,
					repeat_count,
					repeat_end: step == 3,
					message_id: Some(format!("{session_id}-{tick}")),
				})
			}
			5 => RawNotification::Subscription { viewer },
			_ => RawNotification::Like {
				viewer,
				like_count: 40,
				total_like_count: None,
			},
		}
	}
}

impl Default for DemoStream {
	fn default() -> Self {
		Self::new()
	}
}

struct DemoConnection {
	info: ConnectionInfo,
	shutdown_tx: Option<oneshot::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

#[async_trait]
impl StreamConnection for DemoConnection {
	fn info(&self) -> &ConnectionInfo {
		&self.info
	}

	async fn disconnect(&mut self) {
		if let Some(tx) = self.shutdown_tx.take() {
			let _ = tx.send(());
		}
		if let Some(task) = self.task.take()
			&& let Err(e) = task.await
		{
			warn!(error = %e, "demo stream task ended abnormally");
		}
	}
}

impl Drop for DemoConnection {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

async fn emit_loop(
	mut interval: Interval,
	events_tx: NotificationTx,
	session_id: String,
	mut shutdown_rx: oneshot::Receiver<()>,
) {
	let mut tick: u64 = 0;
	loop {
		tokio::select! {
			_ = &mut shutdown_rx => {
				debug!(%session_id, "demo stream shutting down");
				break;
			}
			_ = interval.tick() => {
				let n = DemoStream::make_notification(tick, &session_id);
				tick += 1;
				if events_tx.try_send(n).is_err() {
					if events_tx.is_closed() {
						break;
					}
					warn!("demo stream channel full; dropping notification");
				}
			}
		}
	}
}

#[async_trait]
impl StreamTransport for DemoStream {
	async fn connect(
		&self,
		credentials: &StreamCredentials,
		events_tx: NotificationTx,
	) -> Result<Box<dyn StreamConnection>, TransportError> {
		let session_id = new_session_id();

		let mut interval = tokio::time::interval(self.emit_interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		info!(
			broadcaster = %credentials.broadcaster,
			%session_id,
			interval_ms = self.emit_interval.as_millis() as u64,
			"demo stream started"
		);

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(emit_loop(interval, events_tx, session_id.clone(), shutdown_rx));

		Ok(Box::new(DemoConnection {
			info: ConnectionInfo {
				room_id: Some(format!("demo:{}", credentials.broadcaster)),
				session_id,
			},
			shutdown_tx: Some(shutdown_tx),
			task: Some(task),
		}))
	}
}

#[cfg(test)]
mod tests {
	use tikcon_platform::notification_channel;

	use super::*;

	#[test]
	fn cycle_shape() {
		let kinds: Vec<&str> = (0..8).map(|t| DemoStream::make_notification(t, "s").kind()).collect();
		assert_eq!(kinds, vec!["gift", "gift", "gift", "gift", "like", "subscription", "like", "like"]);

		let RawNotification::Gift(last) = DemoStream::make_notification(3, "s") else {
			panic!("expected gift");
		};
		assert!(last.repeat_end);
		assert_eq!(last.repeat_count, 5);
		assert_eq!(last.message_id.as_deref(), Some("s-3"));
	}

	#[tokio::test(start_paused = true)]
	async fn emits_until_disconnected() {
		let (tx, mut rx) = notification_channel(64);
		let creds = StreamCredentials {
			broadcaster: "demo".to_string(),
			session_token: None,
		};

		let mut conn = DemoStream::new()
			.with_emit_interval(Duration::from_millis(10))
			.connect(&creds, tx)
			.await
			.expect("connect");
		assert_eq!(conn.info().room_id.as_deref(), Some("demo:demo"));

		let first = rx.recv().await.expect("notification");
		assert!(matches!(first, RawNotification::Gift(_)));

		conn.disconnect().await;
		while rx.recv().await.is_some() {}
	}
}
