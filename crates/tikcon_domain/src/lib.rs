#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown event kind: {0}")]
	UnknownKind(String),
	#[error("unknown log level: {0}")]
	UnknownLevel(String),
}

/// Kinds of normalized viewer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Gift,
	Subscription,
	Likes,
}

impl EventKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Gift => "gift",
			EventKind::Subscription => "subscription",
			EventKind::Likes => "likes",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"gift" => Ok(EventKind::Gift),
			"subscription" | "subscribe" | "sub" => Ok(EventKind::Subscription),
			"likes" | "like" => Ok(EventKind::Likes),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Upstream viewer identifier (platform unique id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl ViewerId {
	/// Create a non-empty `ViewerId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ViewerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ViewerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ViewerId::new(s.to_string())
	}
}

/// Configured action identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
	/// Create a non-empty `ActionId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ActionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ActionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ActionId::new(s.to_string())
	}
}

/// Viewer reference carried by notifications and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
	pub id: ViewerId,
	#[serde(default)]
	pub display_name: String,
}

impl Viewer {
	pub fn new(id: ViewerId, display_name: impl Into<String>) -> Self {
		Self {
			id,
			display_name: display_name.into(),
		}
	}

	/// Placeholder viewer for manually triggered runs.
	pub fn manual() -> Self {
		Self {
			id: ViewerId(String::from("manual")),
			display_name: "Manual".to_string(),
		}
	}

	/// Display name, falling back to the id when the platform sent none.
	pub fn label(&self) -> &str {
		if self.display_name.trim().is_empty() {
			self.id.as_str()
		} else {
			&self.display_name
		}
	}
}

/// One confirmed batch of logical occurrences, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
	pub kind: EventKind,
	pub viewer_id: ViewerId,
	pub display_name: String,
	#[serde(default)]
	pub gift_name: Option<String>,
	pub occurrence_count: u32,
	/// Cumulative count reported upstream (combo count, running like total).
	#[serde(default)]
	pub total_seen: Option<u64>,
	pub timestamp: SystemTime,
}

impl NormalizedEvent {
	pub fn gift(viewer: &Viewer, gift_name: impl Into<String>, occurrence_count: u32, total_seen: u64) -> Self {
		Self {
			kind: EventKind::Gift,
			viewer_id: viewer.id.clone(),
			display_name: viewer.label().to_string(),
			gift_name: Some(gift_name.into()),
			occurrence_count,
			total_seen: Some(total_seen),
			timestamp: SystemTime::now(),
		}
	}

	pub fn subscription(viewer: &Viewer) -> Self {
		Self {
			kind: EventKind::Subscription,
			viewer_id: viewer.id.clone(),
			display_name: viewer.label().to_string(),
			gift_name: None,
			occurrence_count: 1,
			total_seen: None,
			timestamp: SystemTime::now(),
		}
	}

	pub fn likes(viewer: &Viewer, delta: u32, running_total: u64) -> Self {
		Self {
			kind: EventKind::Likes,
			viewer_id: viewer.id.clone(),
			display_name: viewer.label().to_string(),
			gift_name: None,
			occurrence_count: delta,
			total_seen: Some(running_total),
			timestamp: SystemTime::now(),
		}
	}
}

/// Trigger condition of a configured action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
	/// Fires for a gift with this name (case-insensitive).
	Gift { gift_name: String },

	/// Fires once per viewer per stream session.
	Subscription,

	/// Fires when a viewer's accumulated likes reach the threshold.
	Likes {
		#[serde(default = "default_like_threshold")]
		threshold: u64,
	},
}

/// Default like threshold for like-triggered actions.
pub const DEFAULT_LIKE_THRESHOLD: u64 = 100;

fn default_like_threshold() -> u64 {
	DEFAULT_LIKE_THRESHOLD
}

impl Trigger {
	pub fn kind(&self) -> EventKind {
		match self {
			Trigger::Gift { .. } => EventKind::Gift,
			Trigger::Subscription => EventKind::Subscription,
			Trigger::Likes { .. } => EventKind::Likes,
		}
	}

	pub fn gift_name(&self) -> Option<&str> {
		match self {
			Trigger::Gift { gift_name } => Some(gift_name),
			_ => None,
		}
	}
}

/// Action binding as stored in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
	pub id: ActionId,
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	pub trigger: Trigger,
	/// Script source handed to the script compiler.
	#[serde(default)]
	pub code: String,
}

fn default_enabled() -> bool {
	true
}

/// Severity/type of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
	Info,
	Warn,
	Error,
	Gift,
	Subscribe,
	Like,
	Action,
}

impl LogLevel {
	pub const fn as_str(self) -> &'static str {
		match self {
			LogLevel::Info => "info",
			LogLevel::Warn => "warn",
			LogLevel::Error => "error",
			LogLevel::Gift => "gift",
			LogLevel::Subscribe => "subscribe",
			LogLevel::Like => "like",
			LogLevel::Action => "action",
		}
	}
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for LogLevel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"info" => Ok(LogLevel::Info),
			"warn" | "warning" => Ok(LogLevel::Warn),
			"error" => Ok(LogLevel::Error),
			"gift" => Ok(LogLevel::Gift),
			"subscribe" => Ok(LogLevel::Subscribe),
			"like" => Ok(LogLevel::Like),
			"action" => Ok(LogLevel::Action),
			other => Err(ParseIdError::UnknownLevel(other.to_string())),
		}
	}
}
