#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tikcon_domain::{ActionConfig, ActionId, LogLevel, NormalizedEvent, Trigger, Viewer, ViewerId};
use tikcon_engine::{
	ActionRunner, BridgeConfig, CompileError, ConnectionState, Engine, EngineError, ExecutionError, ScriptCompiler,
	ScriptContext, TemplateCompiler,
};
use tikcon_platform::{
	ConnectionInfo, ConsoleCredentials, ConsoleSession, ConsoleTransport, GiftNotification, NotificationTx,
	RawNotification, StreamConnection, StreamCredentials, StreamTransport, TransportError,
};
use tokio::time::{sleep, timeout};

#[derive(Default)]
struct FakeStream {
	attempts: AtomicU32,
	offline: AtomicBool,
	events_tx: Mutex<Option<NotificationTx>>,
}

struct FakeConnection {
	info: ConnectionInfo,
}

#[async_trait]
impl StreamConnection for FakeConnection {
	fn info(&self) -> &ConnectionInfo {
		&self.info
	}

	async fn disconnect(&mut self) {}
}

#[async_trait]
impl StreamTransport for FakeStream {
	async fn connect(
		&self,
		_credentials: &StreamCredentials,
		events_tx: NotificationTx,
	) -> Result<Box<dyn StreamConnection>, TransportError> {
		let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
		if self.offline.load(Ordering::SeqCst) {
			return Err(TransportError::Connect(format!("offline (attempt {attempt})")));
		}
		*self.events_tx.lock() = Some(events_tx);
		Ok(Box::new(FakeConnection {
			info: ConnectionInfo {
				room_id: Some("room-1".to_string()),
				session_id: format!("fake-{attempt}"),
			},
		}))
	}
}

impl FakeStream {
	async fn push(&self, n: RawNotification) {
		let tx = self.events_tx.lock().clone().expect("stream connected");
		tx.send(n).await.expect("pump alive");
	}
}

#[derive(Default)]
struct RecordingConsole {
	sent: Arc<Mutex<Vec<String>>>,
}

struct RecordingSession {
	sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ConsoleSession for RecordingSession {
	async fn send(&mut self, command: &str) -> Result<String, TransportError> {
		self.sent.lock().push(command.to_string());
		Ok(String::new())
	}

	async fn close(&mut self) {}
}

#[async_trait]
impl ConsoleTransport for RecordingConsole {
	async fn connect(&self, _credentials: &ConsoleCredentials) -> Result<Box<dyn ConsoleSession>, TransportError> {
		Ok(Box::new(RecordingSession {
			sent: Arc::clone(&self.sent),
		}))
	}
}

fn action(id: &str, trigger: Trigger, code: &str) -> ActionConfig {
	ActionConfig {
		id: ActionId::new(id).expect("id"),
		name: id.to_string(),
		description: String::new(),
		enabled: true,
		trigger,
		code: code.to_string(),
	}
}

fn rose_trigger() -> Trigger {
	Trigger::Gift {
		gift_name: "Rose".to_string(),
	}
}

fn config(actions: Vec<ActionConfig>) -> BridgeConfig {
	BridgeConfig {
		stream: StreamCredentials {
			broadcaster: "streamer".to_string(),
			session_token: None,
		},
		target_player: "Steve".to_string(),
		actions,
		..BridgeConfig::default()
	}
}

fn viewer(id: &str) -> Viewer {
	Viewer::new(ViewerId::new(id).expect("id"), id)
}

fn rose(viewer_id: &str, repeat_count: u32, message_id: &str, repeat_end: bool) -> RawNotification {
	RawNotification::Gift(GiftNotification {
		viewer: viewer(viewer_id),
		gift_id: 5655,
		gift_name: "Rose".to_string(),
		combo: true,
		repeat_count,
		repeat_end,
		message_id: Some(message_id.to_string()),
	})
}

struct Harness {
	engine: Engine,
	stream: Arc<FakeStream>,
	sent: Arc<Mutex<Vec<String>>>,
}

fn harness_with(cfg: BridgeConfig, compiler: Arc<dyn ScriptCompiler>) -> Harness {
	let stream = Arc::new(FakeStream::default());
	let console = RecordingConsole::default();
	let sent = Arc::clone(&console.sent);
	let engine = Engine::new(cfg, stream.clone(), Arc::new(console), compiler).expect("engine");
	Harness { engine, stream, sent }
}

fn harness(actions: Vec<ActionConfig>) -> Harness {
	harness_with(config(actions), Arc::new(TemplateCompiler))
}

async fn wait_connected(engine: &Engine) {
	let mut rx = engine.subscribe_state();
	timeout(Duration::from_secs(2), rx.wait_for(|s| *s == ConnectionState::Connected))
		.await
		.expect("connected in time")
		.expect("state channel open");
}

async fn wait_sent(sent: &Mutex<Vec<String>>, n: usize) -> Vec<String> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while sent.lock().len() < n && tokio::time::Instant::now() < deadline {
		sleep(Duration::from_millis(10)).await;
	}
	// Give a stray extra command the chance to show up.
	sleep(Duration::from_millis(50)).await;
	sent.lock().clone()
}

#[tokio::test]
async fn rose_combo_runs_action_once_per_confirmed_occurrence() {
	let h = harness(vec![action("rose", rose_trigger(), "say rose {iteration}/{repetitions}")]);
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.stream.push(rose("alice", 1, "m1", false)).await;
	h.stream.push(rose("alice", 3, "m2", false)).await;
	sleep(Duration::from_millis(500)).await;
	h.stream.push(rose("alice", 3, "m3", false)).await;
	h.stream.push(rose("alice", 7, "m4", true)).await;

	let sent = wait_sent(&h.sent, 8).await;
	assert_eq!(sent, vec![
		"say rose 1/1",
		"say rose 1/2",
		"say rose 2/2",
		"say rose 1/1",
		"say rose 1/4",
		"say rose 2/4",
		"say rose 3/4",
		"say rose 4/4",
	]);

	h.engine.stop().await;
}

#[tokio::test]
async fn identical_redelivery_confirms_once() {
	let h = harness(vec![action("rose", rose_trigger(), "say {count}")]);
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.stream.push(rose("bob", 2, "dup", false)).await;
	h.stream.push(rose("bob", 2, "dup", false)).await;

	let sent = wait_sent(&h.sent, 2).await;
	assert_eq!(sent, vec!["say 2", "say 2"]);

	let gifts = h
		.engine
		.log()
		.snapshot()
		.into_iter()
		.filter(|e| e.level == LogLevel::Gift)
		.count();
	assert_eq!(gifts, 1);

	h.engine.stop().await;
}

#[tokio::test]
async fn subscription_fires_once_per_session() {
	let h = harness(vec![action("sub", Trigger::Subscription, "say thanks {name}")]);
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	for _ in 0..5 {
		h.stream
			.push(RawNotification::Subscription { viewer: viewer("carol") })
			.await;
	}

	let sent = wait_sent(&h.sent, 1).await;
	assert_eq!(sent, vec!["say thanks carol"]);

	h.engine.stop().await;
}

#[tokio::test]
async fn likes_threshold_fires_once_without_carrying_overflow() {
	let h = harness(vec![action("likes", Trigger::Likes { threshold: 100 }, "say likes {total}")]);
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	for n in [60, 50, 80] {
		h.stream
			.push(RawNotification::Like {
				viewer: viewer("dave"),
				like_count: n,
				total_like_count: None,
			})
			.await;
	}

	// 60 + 50 fires and resets to zero; the following 80 stays below the threshold.
	let sent = wait_sent(&h.sent, 1).await;
	assert_eq!(sent, vec!["say likes 110"]);

	h.engine.stop().await;
}

/// Runner that fails on one iteration.
struct FailOn(u32);

#[async_trait]
impl ActionRunner for FailOn {
	async fn run(&self, _event: &NormalizedEvent, ctx: &mut ScriptContext<'_>) -> Result<Value, ExecutionError> {
		if ctx.iteration == self.0 {
			return Err(ExecutionError::Script("thrown by script".to_string()));
		}
		ctx.console.send(&format!("run {}", ctx.iteration)).await?;
		Ok(Value::Null)
	}
}

struct FailOnCompiler;

impl ScriptCompiler for FailOnCompiler {
	fn compile(&self, _source: &str) -> Result<Arc<dyn ActionRunner>, CompileError> {
		Ok(Arc::new(FailOn(2)))
	}
}

#[tokio::test]
async fn failing_iteration_is_logged_and_batch_continues() {
	let h = harness_with(config(vec![action("rose", rose_trigger(), "x")]), Arc::new(FailOnCompiler));
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.stream.push(rose("erin", 3, "m1", false)).await;

	let sent = wait_sent(&h.sent, 2).await;
	assert_eq!(sent, vec!["run 1", "run 3"]);

	let runs: Vec<(LogLevel, String)> = h
		.engine
		.log()
		.snapshot()
		.into_iter()
		.filter(|e| matches!(e.level, LogLevel::Action | LogLevel::Error))
		.map(|e| (e.level, e.message))
		.collect();
	assert_eq!(runs.len(), 3);
	assert_eq!(runs[0].0, LogLevel::Action);
	assert_eq!(runs[1].0, LogLevel::Error);
	assert!(runs[1].1.contains("thrown by script"));
	assert_eq!(runs[2].0, LogLevel::Action);

	assert!(h.engine.status().await.running);
	h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_retries() {
	let h = harness(Vec::new());
	h.stream.offline.store(true, Ordering::SeqCst);

	h.engine.start().await.expect("start");
	// Attempts at t=0, 10s, 20s and 30s.
	sleep(Duration::from_secs(35)).await;
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 4);
	assert_eq!(h.engine.state(), ConnectionState::Retrying { attempt: 4 });

	h.engine.stop().await;
	let attempts = h.stream.attempts.load(Ordering::SeqCst);

	sleep(Duration::from_secs(120)).await;
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), attempts);

	let status = h.engine.status().await;
	assert!(!status.running);
	assert_eq!(status.state, ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn upstream_disconnect_retries_and_clears_session_state() {
	let h = harness(vec![action("sub", Trigger::Subscription, "say sub {name}")]);
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.stream
		.push(RawNotification::Subscription { viewer: viewer("frank") })
		.await;
	h.stream
		.push(RawNotification::Disconnected {
			reason: Some("stream ended".to_string()),
		})
		.await;

	let mut rx = h.engine.subscribe_state();
	timeout(Duration::from_secs(1), rx.wait_for(|s| matches!(s, ConnectionState::Retrying { .. })))
		.await
		.expect("retrying in time")
		.expect("state channel open");

	sleep(Duration::from_secs(11)).await;
	assert_eq!(h.engine.state(), ConnectionState::Connected);
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 2);

	h.stream
		.push(RawNotification::Subscription { viewer: viewer("frank") })
		.await;

	let sent = wait_sent(&h.sent, 2).await;
	assert_eq!(sent.iter().filter(|c| c.as_str() == "say sub frank").count(), 2);

	h.engine.stop().await;
}

/// Runner that sends one command and then stays busy.
struct Stall(Duration);

#[async_trait]
impl ActionRunner for Stall {
	async fn run(&self, _event: &NormalizedEvent, ctx: &mut ScriptContext<'_>) -> Result<Value, ExecutionError> {
		ctx.console.send(&format!("slow {}", ctx.iteration)).await?;
		sleep(self.0).await;
		Ok(Value::Null)
	}
}

struct StallCompiler(Duration);

impl ScriptCompiler for StallCompiler {
	fn compile(&self, _source: &str) -> Result<Arc<dyn ActionRunner>, CompileError> {
		Ok(Arc::new(Stall(self.0)))
	}
}

#[tokio::test(start_paused = true)]
async fn upstream_disconnect_is_reported_while_queued_runs_drain() {
	let h = harness_with(
		config(vec![action("rose", rose_trigger(), "x")]),
		Arc::new(StallCompiler(Duration::from_secs(5))),
	);
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.stream.push(rose("hank", 6, "m1", false)).await;
	h.stream
		.push(RawNotification::Disconnected {
			reason: Some("stream ended".to_string()),
		})
		.await;

	sleep(Duration::from_secs(1)).await;
	assert_eq!(h.engine.state(), ConnectionState::Retrying { attempt: 1 });
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 1);

	// The backoff runs alongside the queued runs instead of after them.
	sleep(Duration::from_secs(10)).await;
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 2);
	assert_eq!(h.engine.state(), ConnectionState::Connected);

	sleep(Duration::from_secs(20)).await;
	assert_eq!(*h.sent.lock(), vec!["slow 1", "slow 2", "slow 3", "slow 4", "slow 5", "slow 6"]);

	h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_returns_while_a_manual_run_is_busy() {
	let h = harness_with(
		config(vec![action("stall", rose_trigger(), "x")]),
		Arc::new(StallCompiler(Duration::from_secs(600))),
	);

	let engine = h.engine.clone();
	let manual = tokio::spawn(async move { engine.run_action_once(&ActionId::new("stall").expect("id"), None).await });
	sleep(Duration::from_millis(10)).await;
	assert_eq!(*h.sent.lock(), vec!["slow 1"]);

	let began = tokio::time::Instant::now();
	h.engine.stop().await;
	assert!(began.elapsed() < Duration::from_secs(1));
	assert_eq!(h.engine.state(), ConnectionState::Idle);

	manual.abort();
}

#[tokio::test]
async fn start_without_broadcaster_is_refused() {
	let mut cfg = config(Vec::new());
	cfg.stream.broadcaster = String::new();
	let h = harness_with(cfg, Arc::new(TemplateCompiler));

	let err = h.engine.start().await.unwrap_err();
	assert!(matches!(err, EngineError::MissingBroadcaster));
	assert!(!h.engine.is_running().await);
	assert_eq!(h.engine.state(), ConnectionState::Idle);
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_while_running_keeps_one_session() {
	let h = harness(Vec::new());
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.engine.start().await.expect("restart");
	wait_connected(&h.engine).await;

	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 2);
	assert!(h.engine.is_running().await);
	h.engine.stop().await;
	assert!(!h.engine.is_running().await);
}

#[tokio::test]
async fn invalid_reload_keeps_previous_config() {
	let h = harness(vec![action("rose", rose_trigger(), "say rose")]);

	let mut bad = config(vec![
		action("dup", Trigger::Subscription, "say a"),
		action("dup", Trigger::Subscription, "say b"),
	]);
	bad.target_player = "Alex".to_string();

	let err = h.engine.reload(bad).await.unwrap_err();
	assert!(matches!(err, EngineError::Configuration(_)));
	assert_eq!(h.engine.config().target_player, "Steve");
	assert_eq!(h.engine.actions().len(), 1);

	h.engine
		.reload(config(vec![
			action("sub", Trigger::Subscription, "say sub"),
			action("broken", Trigger::Subscription, "say {oops}"),
		]))
		.await
		.expect("valid reload");

	let actions = h.engine.actions();
	assert_eq!(actions.len(), 2);
	assert!(actions[0].eligible);
	assert!(!actions[1].eligible);
	assert!(actions[1].compile_error.is_some());
}

#[tokio::test]
async fn reload_restarts_a_running_engine() {
	let h = harness(Vec::new());
	h.engine.start().await.expect("start");
	wait_connected(&h.engine).await;

	h.engine
		.reload(config(vec![action("sub", Trigger::Subscription, "say hi {name}")]))
		.await
		.expect("reload");
	wait_connected(&h.engine).await;
	assert_eq!(h.stream.attempts.load(Ordering::SeqCst), 2);

	h.stream
		.push(RawNotification::Subscription { viewer: viewer("gina") })
		.await;
	assert_eq!(wait_sent(&h.sent, 1).await, vec!["say hi gina"]);

	h.engine.stop().await;
}

#[tokio::test]
async fn manual_runs() {
	let mut disabled = action("off", Trigger::Subscription, "say off");
	disabled.enabled = false;
	let h = harness(vec![
		action("rose", rose_trigger(), "@log manual {gift}\nsay {name} {gift} {count}"),
		disabled,
	]);

	let outcome = h
		.engine
		.run_action_once(&ActionId::new("rose").expect("id"), None)
		.await
		.expect("run");
	assert!(outcome.is_ok());
	assert_eq!(outcome.log_lines[0], "manual Rose");
	assert_eq!(*h.sent.lock(), vec!["say Manual Rose 1"]);

	let err = h
		.engine
		.run_action_once(&ActionId::new("missing").expect("id"), None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::UnknownAction(_)));

	let err = h
		.engine
		.run_action_once(&ActionId::new("off").expect("id"), None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::NotRunnable(_)));

	let err = h
		.engine
		.test_action(action("draft", rose_trigger(), ""), None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Compile { .. }));

	let outcome = h
		.engine
		.test_action(action("draft", Trigger::Subscription, "say draft {name}"), None)
		.await
		.expect("test run");
	assert!(outcome.is_ok());

	h.engine.clear_log();
	assert!(h.engine.status().await.recent_log.is_empty());
}
