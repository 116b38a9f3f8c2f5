#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tikcon_domain::{ActionConfig, ActionId, Trigger};
use tracing::warn;

use crate::error::CompileError;
use crate::script::{ActionRunner, ScriptCompiler};

/// A configured action together with its compile result.
pub struct CompiledAction {
	pub config: ActionConfig,
	pub runner: Option<Arc<dyn ActionRunner>>,
	pub compile_error: Option<CompileError>,
}

impl CompiledAction {
	pub fn compile(config: ActionConfig, compiler: &dyn ScriptCompiler) -> Self {
		match compiler.compile(&config.code) {
			Ok(runner) => Self {
				config,
				runner: Some(runner),
				compile_error: None,
			},
			Err(e) => {
				warn!(action_id = %config.id, error = %e, "action failed to compile");
				Self {
					config,
					runner: None,
					compile_error: Some(e),
				}
			}
		}
	}

	pub fn id(&self) -> &ActionId {
		&self.config.id
	}

	pub fn name(&self) -> &str {
		&self.config.name
	}

	/// Enabled and compiled.
	pub fn is_eligible(&self) -> bool {
		self.config.enabled && self.runner.is_some()
	}
}

impl fmt::Debug for CompiledAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompiledAction")
			.field("id", &self.config.id)
			.field("enabled", &self.config.enabled)
			.field("compiled", &self.runner.is_some())
			.field("compile_error", &self.compile_error)
			.finish()
	}
}

/// Index of the current action set by trigger.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
	actions: Vec<Arc<CompiledAction>>,
	by_id: HashMap<ActionId, usize>,
	/// Lowercased gift name -> first eligible action in config order.
	by_gift: HashMap<String, usize>,
	subscription: Option<usize>,
	/// Eligible like actions, config order.
	likes: Vec<(u64, usize)>,
}

impl TriggerRegistry {
	/// Compile every action and index the eligible ones.
	pub fn build(configs: &[ActionConfig], compiler: &dyn ScriptCompiler) -> Self {
		let mut reg = TriggerRegistry::default();

		for config in configs {
			let idx = reg.actions.len();
			let action = CompiledAction::compile(config.clone(), compiler);

			reg.by_id.entry(action.config.id.clone()).or_insert(idx);

			if action.is_eligible() {
				match &action.config.trigger {
					Trigger::Gift { gift_name } => {
						reg.by_gift.entry(gift_name.trim().to_lowercase()).or_insert(idx);
					}
					Trigger::Subscription => {
						reg.subscription.get_or_insert(idx);
					}
					Trigger::Likes { threshold } => {
						reg.likes.push((*threshold, idx));
					}
				}
			}

			reg.actions.push(Arc::new(action));
		}

		reg
	}

	/// First eligible action for this gift name (case-insensitive).
	pub fn resolve_gift(&self, gift_name: &str) -> Option<Arc<CompiledAction>> {
		self.by_gift
			.get(&gift_name.trim().to_lowercase())
			.map(|&idx| Arc::clone(&self.actions[idx]))
	}

	pub fn resolve_subscription(&self) -> Option<Arc<CompiledAction>> {
		self.subscription.map(|idx| Arc::clone(&self.actions[idx]))
	}

	/// All eligible like actions whose threshold is at most `total`, in config order.
	pub fn resolve_likes(&self, total: u64) -> Vec<Arc<CompiledAction>> {
		self.likes
			.iter()
			.filter(|(threshold, _)| *threshold <= total)
			.map(|&(_, idx)| Arc::clone(&self.actions[idx]))
			.collect()
	}

	pub fn get(&self, id: &ActionId) -> Option<Arc<CompiledAction>> {
		self.by_id.get(id).map(|&idx| Arc::clone(&self.actions[idx]))
	}

	/// Every configured action, config order.
	pub fn actions(&self) -> &[Arc<CompiledAction>] {
		&self.actions
	}

	pub fn compile_error_count(&self) -> usize {
		self.actions.iter().filter(|a| a.compile_error.is_some()).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::script::TemplateCompiler;

	fn action(id: &str, trigger: Trigger, code: &str) -> ActionConfig {
		ActionConfig {
			id: ActionId::new(id).expect("id"),
			name: id.to_uppercase(),
			description: String::new(),
			enabled: true,
			trigger,
			code: code.to_string(),
		}
	}

	fn gift(name: &str) -> Trigger {
		Trigger::Gift {
			gift_name: name.to_string(),
		}
	}

	#[test]
	fn gift_lookup_is_case_insensitive_and_first_wins() {
		let reg = TriggerRegistry::build(
			&[
				action("first", gift("Rose"), "say 1"),
				action("second", gift("rose"), "say 2"),
			],
			&TemplateCompiler,
		);

		let hit = reg.resolve_gift("ROSE").expect("resolved");
		assert_eq!(hit.id().as_str(), "first");
		assert!(reg.resolve_gift("Lion").is_none());
	}

	#[test]
	fn disabled_and_broken_actions_are_never_selected() {
		let mut disabled = action("off", gift("Rose"), "say off");
		disabled.enabled = false;

		let reg = TriggerRegistry::build(
			&[
				disabled,
				action("broken", gift("Rose"), "say {nope}"),
				action("ok", gift("Rose"), "say ok"),
				action("sub-broken", Trigger::Subscription, ""),
			],
			&TemplateCompiler,
		);

		assert_eq!(reg.resolve_gift("rose").expect("resolved").id().as_str(), "ok");
		assert!(reg.resolve_subscription().is_none());
		assert_eq!(reg.compile_error_count(), 2);
		assert!(reg.get(&ActionId::new("broken").expect("id")).is_some());
	}

	#[test]
	fn likes_resolve_in_config_order_up_to_total() {
		let reg = TriggerRegistry::build(
			&[
				action("big", Trigger::Likes { threshold: 500 }, "say big"),
				action("small", Trigger::Likes { threshold: 100 }, "say small"),
				action("mid", Trigger::Likes { threshold: 250 }, "say mid"),
			],
			&TemplateCompiler,
		);

		let ids = |total| -> Vec<String> {
			reg.resolve_likes(total)
				.iter()
				.map(|a| a.id().as_str().to_string())
				.collect()
		};
		assert!(ids(99).is_empty());
		assert_eq!(ids(110), vec!["small"]);
		assert_eq!(ids(600), vec!["big", "small", "mid"]);
	}

	#[test]
	fn first_subscription_action_wins() {
		let reg = TriggerRegistry::build(
			&[
				action("s1", Trigger::Subscription, "say thanks"),
				action("s2", Trigger::Subscription, "say again"),
			],
			&TemplateCompiler,
		);
		assert_eq!(reg.resolve_subscription().expect("resolved").id().as_str(), "s1");
	}
}
