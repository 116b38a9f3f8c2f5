#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;
use tikcon_platform::TransportError;

/// Action script failed to compile. The action is excluded from dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
	/// 1-based source line, when the error is tied to one.
	pub line: Option<usize>,
	pub message: String,
}

impl CompileError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			line: None,
			message: message.into(),
		}
	}

	pub fn at_line(line: usize, message: impl Into<String>) -> Self {
		Self {
			line: Some(line),
			message: message.into(),
		}
	}
}

impl fmt::Display for CompileError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.line {
			Some(line) => write!(f, "line {line}: {}", self.message),
			None => f.write_str(&self.message),
		}
	}
}

impl std::error::Error for CompileError {}

/// Script ran but failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
	#[error("console: {0}")]
	Console(#[from] TransportError),

	#[error("{0}")]
	Script(String),
}

/// Rejected reload payload. The previous configuration stays active.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
	#[error("malformed config payload: {0}")]
	Malformed(String),

	#[error("action id must be non-empty")]
	EmptyActionId,

	#[error("duplicate action id: {0}")]
	DuplicateActionId(String),

	#[error("action {0}: gift trigger needs a gift name")]
	EmptyGiftName(String),

	#[error("action {0}: like threshold must be at least 1")]
	ZeroLikeThreshold(String),

	#[error("log capacity must be at least 1")]
	ZeroLogCapacity,

	#[error("jitter window ({jitter_ms}ms) must be shorter than the combo timeout ({combo_timeout_ms}ms)")]
	JitterNotBelowComboTimeout { jitter_ms: u64, combo_timeout_ms: u64 },

	#[error("console port must be non-zero")]
	ZeroConsolePort,

	#[error("retry backoff must be at least 1ms")]
	ZeroRetryBackoff,

	#[error("console connect timeout must be at least 1ms")]
	ZeroConsoleConnectTimeout,
}

/// Errors returned by the engine's admin surface.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error("action {action_id} does not compile: {source}")]
	Compile {
		action_id: String,
		#[source]
		source: CompileError,
	},

	#[error(transparent)]
	Execution(#[from] ExecutionError),

	#[error(transparent)]
	Configuration(#[from] ConfigurationError),

	#[error("broadcaster id is not configured")]
	MissingBroadcaster,

	#[error("unknown action: {0}")]
	UnknownAction(String),

	#[error("action {0} is disabled")]
	NotRunnable(String),
}
