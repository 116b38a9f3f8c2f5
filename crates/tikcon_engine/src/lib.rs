#![forbid(unsafe_code)]

//! Live event processing and dispatch engine.
//!
//! Raw stream notifications flow through one ordered loop: the
//! [`normalizer::Normalizer`] confirms logical occurrences (via the
//! [`dedup::DedupStore`]), the [`registry::TriggerRegistry`] resolves actions,
//! and a per-session dispatch worker runs them against the
//! [`gateway::ConsoleGateway`]. [`Engine`] owns the connection lifecycle and is
//! the surface handed to the admin layer.

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod exec_log;
pub mod gateway;
pub mod lifecycle;
pub mod normalizer;
pub mod registry;
pub mod script;



pub use config::{BridgeConfig, TimingConfig};
pub use error::{CompileError, ConfigurationError, EngineError, ExecutionError};
pub use exec_log::{ExecutionLog, ExecutionLogEntry};
pub use lifecycle::{ActionSummary, ConnectionState, Engine, EngineStatus};
pub use script::{ActionRunner, Console, ExecutionOutcome, ScriptCompiler, ScriptContext, ScriptVars, TemplateCompiler};
