#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tikcon_domain::{ActionConfig, ActionId, EventKind, LogLevel, NormalizedEvent, Trigger, Viewer};
use tikcon_platform::{
	ConsoleTransport, NotificationRx, RawNotification, StreamConnection, StreamTransport, notification_channel,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dedup::DedupConfig;
use crate::dispatch::{self, DispatchPlan, Dispatcher, RunEnv};
use crate::error::EngineError;
use crate::exec_log::{ExecutionLog, ExecutionLogEntry};
use crate::gateway::ConsoleGateway;
use crate::normalizer::Normalizer;
use crate::registry::{CompiledAction, TriggerRegistry};
use crate::script::{ExecutionOutcome, ScriptCompiler, ScriptVars};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1_024;

/// Observable stream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
	Idle,
	Connecting,
	Connected,
	Disconnected,
	/// Waiting out the backoff before reconnect attempt `attempt`.
	Retrying { attempt: u32 },
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Idle => f.write_str("idle"),
			Self::Connecting => f.write_str("connecting"),
			Self::Connected => f.write_str("connected"),
			Self::Disconnected => f.write_str("disconnected"),
			Self::Retrying { attempt } => write!(f, "retrying (attempt {attempt})"),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
	/// A session task exists (connecting, connected or retrying).
	pub running: bool,
	pub state: ConnectionState,
	pub recent_log: Vec<ExecutionLogEntry>,
}

/// Configured action as seen by the admin layer.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
	pub config: ActionConfig,
	pub compile_error: Option<String>,
	pub eligible: bool,
}

struct Supervisor {
	shutdown_tx: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

struct Shared {
	config: RwLock<BridgeConfig>,
	registry: RwLock<Arc<TriggerRegistry>>,
	compiler: Arc<dyn ScriptCompiler>,
	stream: Arc<dyn StreamTransport>,
	gateway: Arc<ConsoleGateway>,
	log: Arc<ExecutionLog>,
	state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
	fn set_state(&self, state: ConnectionState) {
		metrics::gauge!("tikcon_stream_connected").set(if state == ConnectionState::Connected { 1.0 } else { 0.0 });
		self.state_tx.send_replace(state);
	}

	fn dispatcher(&self) -> Dispatcher {
		Dispatcher::new(Arc::clone(&self.gateway), Arc::clone(&self.log))
	}
}

fn run_env(cfg: &BridgeConfig) -> RunEnv {
	RunEnv {
		vars: ScriptVars {
			target_player: cfg.target_player.clone(),
			broadcaster: cfg.stream.broadcaster.clone(),
		},
		console: cfg.console.clone(),
	}
}

/// Connection lifecycle manager and admin surface.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
	shared: Arc<Shared>,
	supervisor: Arc<Mutex<Option<Supervisor>>>,
}

impl Engine {
	pub fn new(
		config: BridgeConfig,
		stream: Arc<dyn StreamTransport>,
		console: Arc<dyn ConsoleTransport>,
		compiler: Arc<dyn ScriptCompiler>,
	) -> Result<Self, EngineError> {
		config.validate()?;

		let registry = TriggerRegistry::build(&config.actions, compiler.as_ref());
		let gateway = ConsoleGateway::new(console, config.timing.console_connect_timeout());
		let log = ExecutionLog::new(config.log_capacity);
		let (state_tx, _state_rx) = watch::channel(ConnectionState::Idle);

		Ok(Self {
			shared: Arc::new(Shared {
				config: RwLock::new(config),
				registry: RwLock::new(Arc::new(registry)),
				compiler,
				stream,
				gateway: Arc::new(gateway),
				log: Arc::new(log),
				state_tx,
			}),
			supervisor: Arc::new(Mutex::new(None)),
		})
	}

	/// Start following the configured broadcaster.
	///
	/// An active session is torn down first.
	pub async fn start(&self) -> Result<(), EngineError> {
		let mut slot = self.supervisor.lock().await;
		if let Some(sup) = slot.take() {
			debug!("start while active; tearing down previous session");
			self.teardown(sup).await;
		}

		let cfg = self.shared.config.read().clone();
		if cfg.stream.broadcaster.trim().is_empty() {
			self.shared
				.log
				.record(LogLevel::Warn, "cannot start: broadcaster id is not configured");
			self.shared.set_state(ConnectionState::Idle);
			return Err(EngineError::MissingBroadcaster);
		}

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(run_session(Arc::clone(&self.shared), cfg.clone(), shutdown_rx));
		*slot = Some(Supervisor { shutdown_tx, task });

		self.shared
			.log
			.record(LogLevel::Info, format!("engine started for @{}", cfg.stream.broadcaster));
		Ok(())
	}

	/// Stop the session, cancel pending retries and tear down the console.
	pub async fn stop(&self) {
		let mut slot = self.supervisor.lock().await;
		match slot.take() {
			Some(sup) => {
				self.teardown(sup).await;
				self.shared.log.record(LogLevel::Info, "engine stopped");
			}
			None => {
				self.shared.gateway.disconnect().await;
				self.shared.set_state(ConnectionState::Idle);
			}
		}
	}

	async fn teardown(&self, sup: Supervisor) {
		let _ = sup.shutdown_tx.send(());
		if let Err(e) = sup.task.await {
			warn!(error = %e, "session task ended abnormally");
		}
		self.shared.gateway.disconnect().await;
		self.shared.set_state(ConnectionState::Idle);
	}

	/// Validate and swap in a new configuration.
	///
	/// On error the previous configuration stays active. A running engine is
	/// restarted so the new settings take effect.
	pub async fn reload(&self, config: BridgeConfig) -> Result<(), EngineError> {
		if let Err(e) = config.validate() {
			self.shared
				.log
				.record(LogLevel::Error, format!("configuration rejected: {e}"));
			return Err(e.into());
		}

		let registry = TriggerRegistry::build(&config.actions, self.shared.compiler.as_ref());
		for action in registry.actions() {
			if let Some(err) = &action.compile_error {
				self.shared.log.record_with(
					LogLevel::Warn,
					format!("action {} does not compile: {err}", action.name()),
					json!({ "action_id": action.id().as_str() }),
				);
			}
		}

		let action_count = registry.actions().len();
		self.shared.log.set_capacity(config.log_capacity);
		*self.shared.registry.write() = Arc::new(registry);
		*self.shared.config.write() = config;
		self.shared
			.log
			.record(LogLevel::Info, format!("configuration reloaded ({action_count} actions)"));

		if self.is_running().await {
			self.stop().await;
			self.start().await?;
		}
		Ok(())
	}

	pub async fn is_running(&self) -> bool {
		self.supervisor.lock().await.is_some()
	}

	pub fn state(&self) -> ConnectionState {
		*self.shared.state_tx.borrow()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
		self.shared.state_tx.subscribe()
	}

	pub async fn status(&self) -> EngineStatus {
		EngineStatus {
			running: self.is_running().await,
			state: self.state(),
			recent_log: self.shared.log.snapshot(),
		}
	}

	pub fn config(&self) -> BridgeConfig {
		self.shared.config.read().clone()
	}

	pub fn log(&self) -> Arc<ExecutionLog> {
		Arc::clone(&self.shared.log)
	}

	pub fn clear_log(&self) {
		self.shared.log.clear();
	}

	pub fn actions(&self) -> Vec<ActionSummary> {
		let registry = Arc::clone(&self.shared.registry.read());
		registry
			.actions()
			.iter()
			.map(|a| ActionSummary {
				config: a.config.clone(),
				compile_error: a.compile_error.as_ref().map(ToString::to_string),
				eligible: a.is_eligible(),
			})
			.collect()
	}

	/// Run a configured action once, outside the live stream.
	pub async fn run_action_once(
		&self,
		action_id: &ActionId,
		event: Option<NormalizedEvent>,
	) -> Result<ExecutionOutcome, EngineError> {
		let registry = Arc::clone(&self.shared.registry.read());
		let Some(action) = registry.get(action_id) else {
			return Err(EngineError::UnknownAction(action_id.to_string()));
		};
		if let Some(err) = &action.compile_error {
			return Err(EngineError::Compile {
				action_id: action_id.to_string(),
				source: err.clone(),
			});
		}
		if !action.config.enabled {
			return Err(EngineError::NotRunnable(action_id.to_string()));
		}

		Ok(self.run_manual(&action, event).await)
	}

	/// Compile an unsaved action and run it once.
	pub async fn test_action(
		&self,
		config: ActionConfig,
		event: Option<NormalizedEvent>,
	) -> Result<ExecutionOutcome, EngineError> {
		let action = CompiledAction::compile(config, self.shared.compiler.as_ref());
		if let Some(err) = action.compile_error.clone() {
			return Err(EngineError::Compile {
				action_id: action.id().to_string(),
				source: err,
			});
		}
		Ok(self.run_manual(&action, event).await)
	}

	async fn run_manual(&self, action: &CompiledAction, event: Option<NormalizedEvent>) -> ExecutionOutcome {
		let env = run_env(&self.shared.config.read());
		let event = event.unwrap_or_else(|| synthetic_event(&action.config));
		info!(action_id = %action.id(), "manual action run");
		self.shared.dispatcher().execute(action, &event, 1, 1, &env).await
	}
}

/// Synthetic event for manual runs, shaped like the action's trigger.
pub fn synthetic_event(config: &ActionConfig) -> NormalizedEvent {
	let viewer = Viewer::manual();
	match &config.trigger {
		Trigger::Gift { gift_name } => NormalizedEvent::gift(&viewer, gift_name.clone(), 1, 1),
		Trigger::Subscription => NormalizedEvent::subscription(&viewer),
		Trigger::Likes { threshold } => NormalizedEvent::likes(&viewer, 1, *threshold),
	}
}

enum SessionEnd {
	Shutdown,
	Disconnected(String),
}

async fn run_session(shared: Arc<Shared>, cfg: BridgeConfig, mut shutdown_rx: oneshot::Receiver<()>) {
	let mut attempt: u32 = 0;
	let backoff = cfg.timing.retry_backoff();

	// One worker for the whole run: plans queued before a disconnect keep
	// draining through the backoff and stay ordered ahead of the next session.
	let (plan_tx, plan_rx) = mpsc::unbounded_channel::<DispatchPlan>();
	let worker = tokio::spawn(dispatch::run_worker(shared.dispatcher(), run_env(&cfg), plan_rx));

	loop {
		shared.set_state(ConnectionState::Connecting);
		metrics::counter!("tikcon_stream_connect_attempts_total").increment(1);

		let (events_tx, events_rx) = notification_channel(NOTIFICATION_CHANNEL_CAPACITY);
		let connected = tokio::select! {
			_ = &mut shutdown_rx => break,
			res = shared.stream.connect(&cfg.stream, events_tx) => res,
		};

		match connected {
			Ok(mut conn) => {
				attempt = 0;
				shared.set_state(ConnectionState::Connected);
				shared.log.record_with(
					LogLevel::Info,
					format!("connected to @{}", cfg.stream.broadcaster),
					json!({ "room_id": conn.info().room_id, "session_id": conn.info().session_id }),
				);

				if let Err(e) = shared.gateway.ensure_connected(&cfg.console).await {
					shared
						.log
						.record(LogLevel::Warn, format!("console not reachable yet: {e}"));
				}

				let end = pump(&shared, &cfg, conn.as_mut(), events_rx, &mut shutdown_rx, &plan_tx).await;
				if let SessionEnd::Disconnected(reason) = &end {
					shared.set_state(ConnectionState::Disconnected);
					shared
						.log
						.record(LogLevel::Warn, format!("stream disconnected: {reason}"));
				}
				conn.disconnect().await;
				shared.gateway.disconnect().await;

				if let SessionEnd::Shutdown = end {
					break;
				}
			}
			Err(e) => {
				shared.log.record_with(
					LogLevel::Error,
					format!("stream connect failed: {e}"),
					json!({ "broadcaster": cfg.stream.broadcaster, "attempt": attempt + 1 }),
				);
			}
		}

		attempt += 1;
		shared.set_state(ConnectionState::Retrying { attempt });
		info!(attempt, backoff_ms = backoff.as_millis() as u64, "scheduling stream reconnect");

		tokio::select! {
			_ = &mut shutdown_rx => break,
			_ = tokio::time::sleep(backoff) => {}
		}
	}

	worker.abort();
	debug!("session task exiting");
}

/// Process notifications for one live connection.
///
/// Per-session state lives here and is dropped with the connection; confirmed
/// plans go to the dispatch worker so script execution never holds up ingestion.
async fn pump(
	shared: &Shared,
	cfg: &BridgeConfig,
	conn: &mut dyn StreamConnection,
	mut events_rx: NotificationRx,
	shutdown_rx: &mut oneshot::Receiver<()>,
	plan_tx: &mpsc::UnboundedSender<DispatchPlan>,
) -> SessionEnd {
	let session_id = conn.info().session_id.clone();
	let mut normalizer = Normalizer::new(DedupConfig::from(&cfg.timing));

	let mut sweep = tokio::time::interval(cfg.timing.sweep_interval());
	sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let end = loop {
		tokio::select! {
			_ = &mut *shutdown_rx => break SessionEnd::Shutdown,

			_ = sweep.tick() => {
				normalizer.prune(Instant::now().into_std());
			}

			raw = events_rx.recv() => {
				let Some(raw) = raw else {
					break SessionEnd::Disconnected("stream closed".to_string());
				};
				if let RawNotification::Disconnected { reason } = raw {
					break SessionEnd::Disconnected(reason.unwrap_or_else(|| "upstream disconnect".to_string()));
				}
				ingest(shared, &mut normalizer, &raw, plan_tx);
			}
		}
	};

	normalizer.clear();
	debug!(%session_id, "session state cleared");
	end
}

fn ingest(
	shared: &Shared,
	normalizer: &mut Normalizer,
	raw: &RawNotification,
	plan_tx: &mpsc::UnboundedSender<DispatchPlan>,
) {
	let Some(event) = normalizer.normalize(raw, Instant::now().into_std()) else {
		return;
	};

	log_event(&shared.log, &event);

	let registry = Arc::clone(&shared.registry.read());
	let plan = dispatch::plan(event, &registry, normalizer);
	if plan.is_empty() {
		if let Some(gift) = plan.event.gift_name.as_deref() {
			shared.log.record(LogLevel::Info, format!("no action for gift {gift}"));
		}
		return;
	}

	if plan_tx.send(plan).is_err() {
		warn!("dispatch worker gone; dropping plan");
	}
}

fn log_event(log: &ExecutionLog, event: &NormalizedEvent) {
	let attachment = json!({ "viewer_id": event.viewer_id.as_str() });
	match event.kind {
		EventKind::Gift => log.record_with(
			LogLevel::Gift,
			format!(
				"{} sent {} x{} (combo {})",
				event.display_name,
				event.gift_name.as_deref().unwrap_or("gift"),
				event.occurrence_count,
				event.total_seen.unwrap_or(u64::from(event.occurrence_count)),
			),
			attachment,
		),
		EventKind::Subscription => log.record_with(LogLevel::Subscribe, format!("{} subscribed", event.display_name), attachment),
		EventKind::Likes => log.record_with(
			LogLevel::Like,
			format!(
				"{} liked x{} (total {})",
				event.display_name,
				event.occurrence_count,
				event.total_seen.unwrap_or_default(),
			),
			attachment,
		),
	}
}
