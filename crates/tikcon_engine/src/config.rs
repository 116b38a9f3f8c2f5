#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tikcon_domain::{ActionConfig, Trigger};
use tikcon_platform::{ConsoleCredentials, StreamCredentials};

use crate::error::ConfigurationError;

/// Default capacity of the rolling execution log.
pub const DEFAULT_LOG_CAPACITY: usize = 300;

/// Timing knobs, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
	pub combo_timeout_ms: u64,
	pub jitter_window_ms: u64,
	pub idempotency_ttl_ms: u64,
	pub retry_backoff_ms: u64,
	pub sweep_interval_ms: u64,
	pub console_connect_timeout_ms: u64,
}

impl Default for TimingConfig {
	fn default() -> Self {
		Self {
			combo_timeout_ms: 10_000,
			jitter_window_ms: 2_000,
			idempotency_ttl_ms: 10_000,
			retry_backoff_ms: 10_000,
			sweep_interval_ms: 1_000,
			console_connect_timeout_ms: 5_000,
		}
	}
}

impl TimingConfig {
	pub fn combo_timeout(&self) -> Duration {
		Duration::from_millis(self.combo_timeout_ms)
	}

	pub fn jitter_window(&self) -> Duration {
		Duration::from_millis(self.jitter_window_ms)
	}

	pub fn idempotency_ttl(&self) -> Duration {
		Duration::from_millis(self.idempotency_ttl_ms)
	}

	pub fn retry_backoff(&self) -> Duration {
		Duration::from_millis(self.retry_backoff_ms)
	}

	pub fn sweep_interval(&self) -> Duration {
		Duration::from_millis(self.sweep_interval_ms.max(1))
	}

	pub fn console_connect_timeout(&self) -> Duration {
		Duration::from_millis(self.console_connect_timeout_ms)
	}
}

/// Reloadable engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
	#[serde(default)]
	pub stream: StreamCredentials,

	#[serde(default)]
	pub console: ConsoleCredentials,

	/// In-game player name exposed to scripts as `{target}`.
	#[serde(default)]
	pub target_player: String,

	/// Ordered action list; order breaks resolution ties.
	#[serde(default)]
	pub actions: Vec<ActionConfig>,

	#[serde(default)]
	pub timing: TimingConfig,

	#[serde(default = "default_log_capacity")]
	pub log_capacity: usize,
}

fn default_log_capacity() -> usize {
	DEFAULT_LOG_CAPACITY
}

impl Default for BridgeConfig {
	fn default() -> Self {
		Self {
			stream: StreamCredentials::default(),
			console: ConsoleCredentials::default(),
			target_player: String::new(),
			actions: Vec::new(),
			timing: TimingConfig::default(),
			log_capacity: DEFAULT_LOG_CAPACITY,
		}
	}
}

impl BridgeConfig {
	/// Parse and validate a JSON reload payload.
	pub fn from_json_str(raw: &str) -> Result<Self, ConfigurationError> {
		let cfg: BridgeConfig = serde_json::from_str(raw).map_err(|e| ConfigurationError::Malformed(e.to_string()))?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<(), ConfigurationError> {
		let mut ids = HashSet::new();
		for action in &self.actions {
			let id = action.id.as_str();
			if id.trim().is_empty() {
				return Err(ConfigurationError::EmptyActionId);
			}
			if !ids.insert(id) {
				return Err(ConfigurationError::DuplicateActionId(id.to_string()));
			}

			match &action.trigger {
				Trigger::Gift { gift_name } if gift_name.trim().is_empty() => {
					return Err(ConfigurationError::EmptyGiftName(id.to_string()));
				}
				Trigger::Likes { threshold: 0 } => {
					return Err(ConfigurationError::ZeroLikeThreshold(id.to_string()));
				}
				_ => {}
			}
		}

		if self.log_capacity == 0 {
			return Err(ConfigurationError::ZeroLogCapacity);
		}

		if self.timing.jitter_window_ms >= self.timing.combo_timeout_ms {
			return Err(ConfigurationError::JitterNotBelowComboTimeout {
				jitter_ms: self.timing.jitter_window_ms,
				combo_timeout_ms: self.timing.combo_timeout_ms,
			});
		}

		if self.console.port == 0 {
			return Err(ConfigurationError::ZeroConsolePort);
		}

		if self.timing.retry_backoff_ms == 0 {
			return Err(ConfigurationError::ZeroRetryBackoff);
		}

		if self.timing.console_connect_timeout_ms == 0 {
			return Err(ConfigurationError::ZeroConsoleConnectTimeout);
		}

		Ok(())
	}
}
