#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::json;
use tikcon_domain::{EventKind, LogLevel, NormalizedEvent};
use tikcon_platform::ConsoleCredentials;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ExecutionError;
use crate::exec_log::ExecutionLog;
use crate::gateway::ConsoleGateway;
use crate::normalizer::Normalizer;
use crate::registry::{CompiledAction, TriggerRegistry};
use crate::script::{ExecutionOutcome, ScriptContext, ScriptVars};

/// One resolved action and how many times to run it.
#[derive(Debug, Clone)]
pub struct PlannedRun {
	pub action: Arc<CompiledAction>,
	pub repetitions: u32,
}

/// Runs resolved for one confirmed event.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
	pub event: NormalizedEvent,
	pub runs: Vec<PlannedRun>,
}

impl DispatchPlan {
	pub fn is_empty(&self) -> bool {
		self.runs.is_empty()
	}
}

/// Resolve `event` against `registry`.
///
/// Must be called under the same exclusive access as normalization: for likes
/// the viewer's accumulator is reset here as soon as any threshold matches.
pub fn plan(event: NormalizedEvent, registry: &TriggerRegistry, normalizer: &mut Normalizer) -> DispatchPlan {
	let runs = match event.kind {
		EventKind::Gift => event
			.gift_name
			.as_deref()
			.and_then(|name| registry.resolve_gift(name))
			.map(|action| PlannedRun {
				action,
				repetitions: event.occurrence_count.max(1),
			})
			.into_iter()
			.collect(),

		EventKind::Subscription => registry
			.resolve_subscription()
			.map(|action| PlannedRun { action, repetitions: 1 })
			.into_iter()
			.collect(),

		EventKind::Likes => {
			let total = normalizer.likes_total(&event.viewer_id);
			let matched = registry.resolve_likes(total);
			if !matched.is_empty() {
				normalizer.reset_likes(&event.viewer_id);
			}
			matched
				.into_iter()
				.map(|action| PlannedRun { action, repetitions: 1 })
				.collect()
		}
	};

	DispatchPlan { event, runs }
}

/// Environment shared by every run of one session.
#[derive(Debug, Clone)]
pub struct RunEnv {
	pub vars: ScriptVars,
	pub console: ConsoleCredentials,
}

/// Counts for one executed plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
	pub succeeded: u32,
	pub failed: u32,
}

/// Executes planned runs sequentially against the console gateway.
#[derive(Clone)]
pub struct Dispatcher {
	gateway: Arc<ConsoleGateway>,
	log: Arc<ExecutionLog>,
}

impl Dispatcher {
	pub fn new(gateway: Arc<ConsoleGateway>, log: Arc<ExecutionLog>) -> Self {
		Self { gateway, log }
	}

	/// Run every planned action. Failures are logged per iteration and never abort the batch.
	pub async fn execute_plan(&self, plan: &DispatchPlan, env: &RunEnv) -> DispatchSummary {
		let mut summary = DispatchSummary::default();
		for run in &plan.runs {
			for iteration in 1..=run.repetitions {
				let outcome = self.execute(&run.action, &plan.event, iteration, run.repetitions, env).await;
				if outcome.is_ok() {
					summary.succeeded += 1;
				} else {
					summary.failed += 1;
				}
			}
		}
		summary
	}

	/// Run `action` once and record the outcome in the execution log.
	pub async fn execute(
		&self,
		action: &CompiledAction,
		event: &NormalizedEvent,
		iteration: u32,
		repetitions: u32,
		env: &RunEnv,
	) -> ExecutionOutcome {
		let Some(runner) = action.runner.as_ref() else {
			return ExecutionOutcome {
				log_lines: Vec::new(),
				result: Err(ExecutionError::Script(format!(
					"action {} has no compiled script",
					action.id()
				))),
			};
		};

		metrics::counter!("tikcon_action_runs_total").increment(1);

		let mut console = self.gateway.handle(&env.console);
		let mut ctx = ScriptContext::new(&mut console, &env.vars, iteration, repetitions);
		let result = runner.run(event, &mut ctx).await;
		let log_lines = ctx.into_log_lines();

		match &result {
			Ok(value) => {
				self.log.record_with(
					LogLevel::Action,
					format!("{} executed ({iteration}/{repetitions})", action.name()),
					json!({
						"action_id": action.id().as_str(),
						"viewer_id": event.viewer_id.as_str(),
						"iteration": iteration,
						"log": log_lines,
						"result": value,
					}),
				);
			}
			Err(e) => {
				metrics::counter!("tikcon_action_failures_total").increment(1);
				self.log.record_with(
					LogLevel::Error,
					format!("{} failed ({iteration}/{repetitions}): {e}", action.name()),
					json!({
						"action_id": action.id().as_str(),
						"viewer_id": event.viewer_id.as_str(),
						"iteration": iteration,
						"log": log_lines,
					}),
				);
			}
		}

		ExecutionOutcome { log_lines, result }
	}
}

/// Drain plans in order until the sender side closes.
pub async fn run_worker(dispatcher: Dispatcher, env: RunEnv, mut plans: mpsc::UnboundedReceiver<DispatchPlan>) {
	while let Some(plan) = plans.recv().await {
		let summary = dispatcher.execute_plan(&plan, &env).await;
		debug!(
			viewer_id = %plan.event.viewer_id,
			kind = %plan.event.kind,
			succeeded = summary.succeeded,
			failed = summary.failed,
			"dispatch plan finished"
		);
	}
}
