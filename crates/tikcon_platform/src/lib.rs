#![forbid(unsafe_code)]

pub mod rcon;
pub mod relay;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tikcon_domain::Viewer;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use rcon::RconTransport;
pub use relay::RelayTransport;

/// Upstream stream notification, consumed by one ordered processing loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawNotification {
	Gift(GiftNotification),

	Subscription {
		viewer: Viewer,
	},

	Like {
		viewer: Viewer,
		/// Likes sent in this notification.
		like_count: u32,
		#[serde(default)]
		total_like_count: Option<u64>,
	},

	/// The upstream stream ended or dropped.
	Disconnected {
		#[serde(default)]
		reason: Option<String>,
	},
}

impl RawNotification {
	/// Stable kind label for logs.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Gift(_) => "gift",
			Self::Subscription { .. } => "subscription",
			Self::Like { .. } => "like",
			Self::Disconnected { .. } => "disconnected",
		}
	}
}

/// Gift notification as delivered upstream.
///
/// Combo gifts arrive as a stream of notifications carrying a cumulative
/// `repeat_count`, the last one flagged with `repeat_end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftNotification {
	pub viewer: Viewer,
	pub gift_id: u64,
	pub gift_name: String,

	/// Whether this gift type is delivered as a combo stream.
	#[serde(default)]
	pub combo: bool,

	#[serde(default = "default_repeat_count")]
	pub repeat_count: u32,

	#[serde(default)]
	pub repeat_end: bool,

	/// Upstream delivery id, when the transport supplies one.
	///
	/// Part of the gift idempotency key. Without it, two deliveries of the same
	/// `repeat_count` are indistinguishable: the second is always dropped as a
	/// re-delivery, and the equal-count jitter rule never confirms an extra
	/// occurrence.
	#[serde(default)]
	pub message_id: Option<String>,
}

fn default_repeat_count() -> u32 {
	1
}

impl GiftNotification {
	/// Cumulative count with upstream zeros treated as one.
	pub fn effective_repeat_count(&self) -> u32 {
		self.repeat_count.max(1)
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Transport failures for both the stream and the control channel.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("connect failed: {0}")]
	Connect(String),

	#[error("authentication rejected: {0}")]
	Auth(String),

	#[error("timed out after {0:?}")]
	Timeout(Duration),

	#[error("connection closed")]
	Closed,

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error(transparent)]
	Framing(#[from] tikcon_protocol::FramingError),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Credentials for the upstream live stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCredentials {
	/// Broadcaster handle or id to follow.
	pub broadcaster: String,

	#[serde(default)]
	pub session_token: Option<SecretString>,
}

/// Details reported by a successful stream connect.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
	pub room_id: Option<String>,

	/// Local identifier of this connection, for log correlation.
	pub session_id: String,
}

pub type NotificationTx = mpsc::Sender<RawNotification>;
pub type NotificationRx = mpsc::Receiver<RawNotification>;

/// Build a bounded notification channel.
pub fn notification_channel(capacity: usize) -> (NotificationTx, NotificationRx) {
	mpsc::channel(capacity)
}

/// A live upstream stream connection.
#[async_trait::async_trait]
pub trait StreamConnection: Send + 'static {
	fn info(&self) -> &ConnectionInfo;

	/// Close the connection. Must be safe to call more than once.
	async fn disconnect(&mut self);
}

/// Factory for upstream stream connections.
///
/// Notifications are pushed into `events_tx` until the connection drops; the
/// transport should send `RawNotification::Disconnected` (or close the channel)
/// when that happens.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync + 'static {
	async fn connect(
		&self,
		credentials: &StreamCredentials,
		events_tx: NotificationTx,
	) -> Result<Box<dyn StreamConnection>, TransportError>;
}

/// Remote console (control channel) credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleCredentials {
	pub host: String,

	#[serde(default = "default_console_port")]
	pub port: u16,

	#[serde(default)]
	pub password: SecretString,
}

/// Default Source RCON port.
pub const DEFAULT_CONSOLE_PORT: u16 = 25575;

fn default_console_port() -> u16 {
	DEFAULT_CONSOLE_PORT
}

impl Default for ConsoleCredentials {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: DEFAULT_CONSOLE_PORT,
			password: SecretString::default(),
		}
	}
}

/// An authenticated control-channel session. Sends are sequential.
#[async_trait::async_trait]
pub trait ConsoleSession: Send + 'static {
	/// Execute one command and return the server's response text.
	async fn send(&mut self, command: &str) -> Result<String, TransportError>;

	async fn close(&mut self);
}

/// Factory for control-channel sessions.
#[async_trait::async_trait]
pub trait ConsoleTransport: Send + Sync + 'static {
	async fn connect(&self, credentials: &ConsoleCredentials) -> Result<Box<dyn ConsoleSession>, TransportError>;
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
