#![forbid(unsafe_code)]

//! WebSocket relay stream transport.
//!
//! The relay forwards upstream live-stream notifications as JSON text frames.
//! After the client subscribes, the relay answers with a `connected` frame and
//! then streams `RawNotification` objects until either side closes.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
	ConnectionInfo, NotificationTx, RawNotification, StreamConnection, StreamCredentials, StreamTransport, TransportError,
	new_session_id,
};

type RelayWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
	pub url: Url,
	pub handshake_timeout: Duration,
}

impl RelayConfig {
	pub fn new(url: Url) -> Self {
		Self {
			url,
			handshake_timeout: Duration::from_secs(10),
		}
	}
}

/// Stream transport backed by a WebSocket relay.
#[derive(Debug, Clone)]
pub struct RelayTransport {
	cfg: RelayConfig,
}

impl RelayTransport {
	pub fn new(cfg: RelayConfig) -> Self {
		Self { cfg }
	}
}

#[derive(Serialize)]
struct SubscribeFrame<'a> {
	#[serde(rename = "type")]
	kind: &'static str,
	broadcaster: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	session_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
	Connected {
		#[serde(default)]
		room_id: Option<String>,
	},
	Error {
		message: String,
	},
}

/// A decoded relay text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
	Connected { room_id: Option<String> },
	Error { message: String },
	Notification(RawNotification),
}

/// Decode one relay text frame.
pub fn parse_relay_frame(text: &str) -> Result<RelayFrame, serde_json::Error> {
	let value: serde_json::Value = serde_json::from_str(text)?;
	match value.get("type").and_then(serde_json::Value::as_str) {
		Some("connected") | Some("error") => Ok(match ControlFrame::deserialize(value)? {
			ControlFrame::Connected { room_id } => RelayFrame::Connected { room_id },
			ControlFrame::Error { message } => RelayFrame::Error { message },
		}),
		_ => RawNotification::deserialize(value).map(RelayFrame::Notification),
	}
}

#[async_trait]
impl StreamTransport for RelayTransport {
	async fn connect(
		&self,
		credentials: &StreamCredentials,
		events_tx: NotificationTx,
	) -> Result<Box<dyn StreamConnection>, TransportError> {
		let (mut ws, _resp) = tokio_tungstenite::connect_async(self.cfg.url.as_str())
			.await
			.map_err(|e| TransportError::Connect(format!("relay {}: {e}", self.cfg.url)))?;

		let subscribe = SubscribeFrame {
			kind: "subscribe",
			broadcaster: &credentials.broadcaster,
			session_token: credentials.session_token.as_ref().map(|t| t.expose()),
		};
		let text = serde_json::to_string(&subscribe).map_err(|e| TransportError::Protocol(e.to_string()))?;
		ws.send(Message::Text(text.into()))
			.await
			.map_err(|e| TransportError::Connect(format!("relay subscribe: {e}")))?;

		let room_id = tokio::time::timeout(self.cfg.handshake_timeout, await_connected(&mut ws))
			.await
			.map_err(|_| TransportError::Timeout(self.cfg.handshake_timeout))??;

		let info = ConnectionInfo {
			room_id,
			session_id: new_session_id(),
		};
		info!(session_id = %info.session_id, room_id = ?info.room_id, broadcaster = %credentials.broadcaster, "relay connected");

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(read_loop(ws, events_tx, shutdown_rx, info.session_id.clone()));

		Ok(Box::new(RelayConnection {
			info,
			shutdown_tx: Some(shutdown_tx),
			task: Some(task),
		}))
	}
}

async fn await_connected(ws: &mut RelayWs) -> Result<Option<String>, TransportError> {
	while let Some(msg) = ws.next().await {
		let msg = msg.map_err(|e| TransportError::Connect(format!("relay handshake: {e}")))?;
		match msg {
			Message::Text(t) => match parse_relay_frame(t.as_str()) {
				Ok(RelayFrame::Connected { room_id }) => return Ok(room_id),
				Ok(RelayFrame::Error { message }) => return Err(TransportError::Connect(message)),
				Ok(RelayFrame::Notification(n)) => {
					debug!(kind = n.kind(), "dropping notification received before connected frame");
				}
				Err(e) => return Err(TransportError::Protocol(format!("bad relay frame: {e}"))),
			},
			Message::Close(frame) => {
				return Err(TransportError::Connect(format!("relay closed during handshake: {frame:?}")));
			}
			_ => {}
		}
	}
	Err(TransportError::Closed)
}

async fn read_loop(mut ws: RelayWs, events_tx: NotificationTx, mut shutdown_rx: oneshot::Receiver<()>, session_id: String) {
	let reason = loop {
		tokio::select! {
			_ = &mut shutdown_rx => {
				let _ = ws.close(None).await;
				debug!(%session_id, "relay reader stopped");
				return;
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					break "relay stream ended".to_string();
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => break format!("relay read error: {e}"),
				};

				match msg {
					Message::Text(t) => match parse_relay_frame(t.as_str()) {
						Ok(RelayFrame::Notification(n)) => {
							if events_tx.send(n).await.is_err() {
								debug!(%session_id, "notification receiver dropped; closing relay");
								let _ = ws.close(None).await;
								return;
							}
						}
						Ok(RelayFrame::Error { message }) => {
							warn!(%session_id, %message, "relay reported error");
						}
						Ok(RelayFrame::Connected { .. }) => {}
						Err(e) => {
							warn!(%session_id, error = %e, "ignoring malformed relay frame");
						}
					},

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}

					Message::Close(frame) => break format!("relay closed: {frame:?}"),

					_ => {}
				}
			}
		}
	};

	info!(%session_id, %reason, "relay disconnected");
	let _ = events_tx.send(RawNotification::Disconnected { reason: Some(reason) }).await;
}

struct RelayConnection {
	info: ConnectionInfo,
	shutdown_tx: Option<oneshot::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

#[async_trait]
impl StreamConnection for RelayConnection {
	fn info(&self) -> &ConnectionInfo {
		&self.info
	}

	async fn disconnect(&mut self) {
		if let Some(tx) = self.shutdown_tx.take() {
			let _ = tx.send(());
		}
		if let Some(mut task) = self.task.take()
			&& tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err()
		{
			warn!(session_id = %self.info.session_id, "relay reader did not stop in time; aborting");
			task.abort();
		}
	}
}

impl Drop for RelayConnection {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}
