#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tikcon_domain::LogLevel;
use tracing::{error, info, warn};

use crate::config::DEFAULT_LOG_CAPACITY;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLogEntry {
	pub timestamp_ms: u64,
	pub level: LogLevel,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub attachment: Option<Value>,
}

#[derive(Debug)]
struct Inner {
	capacity: usize,
	entries: VecDeque<ExecutionLogEntry>,
}

/// Bounded rolling log; oldest entries are evicted first.
///
/// Every entry is mirrored to `tracing`.
#[derive(Debug)]
pub struct ExecutionLog {
	inner: Mutex<Inner>,
}

impl Default for ExecutionLog {
	fn default() -> Self {
		Self::new(DEFAULT_LOG_CAPACITY)
	}
}

impl ExecutionLog {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			inner: Mutex::new(Inner {
				capacity,
				entries: VecDeque::with_capacity(capacity),
			}),
		}
	}

	pub fn record(&self, level: LogLevel, message: impl Into<String>) {
		self.push(level, message.into(), None);
	}

	pub fn record_with(&self, level: LogLevel, message: impl Into<String>, attachment: Value) {
		self.push(level, message.into(), Some(attachment));
	}

	fn push(&self, level: LogLevel, message: String, attachment: Option<Value>) {
		match level {
			LogLevel::Error => error!(target: "tikcon::exec", kind = %level, attachment = ?attachment, "{message}"),
			LogLevel::Warn => warn!(target: "tikcon::exec", kind = %level, attachment = ?attachment, "{message}"),
			_ => info!(target: "tikcon::exec", kind = %level, attachment = ?attachment, "{message}"),
		}

		let timestamp_ms = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as u64;

		let mut inner = self.inner.lock();
		inner.entries.push_back(ExecutionLogEntry {
			timestamp_ms,
			level,
			message,
			attachment,
		});
		while inner.entries.len() > inner.capacity {
			inner.entries.pop_front();
		}
	}

	/// Change capacity, evicting the oldest entries if needed.
	pub fn set_capacity(&self, capacity: usize) {
		let mut inner = self.inner.lock();
		inner.capacity = capacity.max(1);
		while inner.entries.len() > inner.capacity {
			inner.entries.pop_front();
		}
	}

	pub fn capacity(&self) -> usize {
		self.inner.lock().capacity
	}

	/// Oldest-first copy of the current entries.
	pub fn snapshot(&self) -> Vec<ExecutionLogEntry> {
		self.inner.lock().entries.iter().cloned().collect()
	}

	/// The newest `n` entries, oldest first.
	pub fn recent(&self, n: usize) -> Vec<ExecutionLogEntry> {
		let inner = self.inner.lock();
		let skip = inner.entries.len().saturating_sub(n);
		inner.entries.iter().skip(skip).cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn clear(&self) {
		self.inner.lock().entries.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evicts_oldest_first() {
		let log = ExecutionLog::new(3);
		for i in 0..5 {
			log.record(LogLevel::Info, format!("entry {i}"));
		}

		let messages: Vec<String> = log.snapshot().into_iter().map(|e| e.message).collect();
		assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
	}

	#[test]
	fn shrinking_capacity_trims_and_clear_empties() {
		let log = ExecutionLog::new(10);
		for i in 0..6 {
			log.record(LogLevel::Gift, format!("g{i}"));
		}
		log.set_capacity(2);
		assert_eq!(log.len(), 2);
		assert_eq!(log.recent(1)[0].message, "g5");

		log.clear();
		assert!(log.is_empty());
	}

	#[test]
	fn attachment_is_kept_and_serialized() {
		let log = ExecutionLog::new(4);
		log.record_with(LogLevel::Error, "boom", serde_json::json!({ "action_id": "a1" }));

		let entry = &log.snapshot()[0];
		assert_eq!(entry.level, LogLevel::Error);
		let json = serde_json::to_value(entry).expect("serialize");
		assert_eq!(json["level"], "error");
		assert_eq!(json["attachment"]["action_id"], "a1");
	}
}
