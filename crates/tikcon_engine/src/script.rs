#![forbid(unsafe_code)]

//! Script boundary.
//!
//! The engine only depends on [`ActionRunner`]; producing a runner from
//! source text is the job of an injected [`ScriptCompiler`]. The built-in
//! [`TemplateCompiler`] treats each source line as a console command template.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tikcon_domain::NormalizedEvent;
use tikcon_platform::TransportError;

use crate::error::{CompileError, ExecutionError};

/// Command sink a script talks to.
#[async_trait]
pub trait Console: Send {
	async fn send(&mut self, command: &str) -> Result<String, TransportError>;
}

/// Values scripts can reference besides the event itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptVars {
	pub target_player: String,
	pub broadcaster: String,
}

/// Per-run environment handed to an [`ActionRunner`].
pub struct ScriptContext<'a> {
	pub console: &'a mut dyn Console,
	pub vars: &'a ScriptVars,
	/// 1-based index of this run within its batch.
	pub iteration: u32,
	pub repetitions: u32,
	log_lines: Vec<String>,
}

impl<'a> ScriptContext<'a> {
	pub fn new(console: &'a mut dyn Console, vars: &'a ScriptVars, iteration: u32, repetitions: u32) -> Self {
		Self {
			console,
			vars,
			iteration,
			repetitions,
			log_lines: Vec::new(),
		}
	}

	pub fn log(&mut self, line: impl Into<String>) {
		self.log_lines.push(line.into());
	}

	pub fn log_lines(&self) -> &[String] {
		&self.log_lines
	}

	pub fn into_log_lines(self) -> Vec<String> {
		self.log_lines
	}
}

/// A compiled action script.
#[async_trait]
pub trait ActionRunner: Send + Sync {
	async fn run(&self, event: &NormalizedEvent, ctx: &mut ScriptContext<'_>) -> Result<Value, ExecutionError>;
}

/// Turns action source text into a runner.
pub trait ScriptCompiler: Send + Sync {
	fn compile(&self, source: &str) -> Result<Arc<dyn ActionRunner>, CompileError>;
}

/// Log lines and result of a single action run.
#[derive(Debug)]
pub struct ExecutionOutcome {
	pub log_lines: Vec<String>,
	pub result: Result<Value, ExecutionError>,
}

impl ExecutionOutcome {
	pub fn is_ok(&self) -> bool {
		self.result.is_ok()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
	Viewer,
	Name,
	Gift,
	Count,
	Total,
	Iteration,
	Repetitions,
	Target,
	Broadcaster,
}

impl Placeholder {
	fn parse(name: &str) -> Option<Self> {
		Some(match name.trim() {
			"viewer" => Self::Viewer,
			"name" => Self::Name,
			"gift" => Self::Gift,
			"count" => Self::Count,
			"total" => Self::Total,
			"iteration" => Self::Iteration,
			"repetitions" => Self::Repetitions,
			"target" => Self::Target,
			"broadcaster" => Self::Broadcaster,
			_ => return None,
		})
	}

	fn render(self, event: &NormalizedEvent, ctx: &ScriptContext<'_>, out: &mut String) {
		match self {
			Self::Viewer => out.push_str(event.viewer_id.as_str()),
			Self::Name => out.push_str(&event.display_name),
			Self::Gift => out.push_str(event.gift_name.as_deref().unwrap_or_default()),
			Self::Count => out.push_str(&event.occurrence_count.to_string()),
			Self::Total => {
				let total = event.total_seen.unwrap_or(u64::from(event.occurrence_count));
				out.push_str(&total.to_string());
			}
			Self::Iteration => out.push_str(&ctx.iteration.to_string()),
			Self::Repetitions => out.push_str(&ctx.repetitions.to_string()),
			Self::Target => out.push_str(&ctx.vars.target_player),
			Self::Broadcaster => out.push_str(&ctx.vars.broadcaster),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
	Text(String),
	Var(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
	Command(Vec<Segment>),
	Log(Vec<Segment>),
}

/// Compiles line-oriented console command templates.
///
/// ```text
/// # comment
/// @log {name} sent {count}x {gift}
/// execute at {target} run summon zombie ~ ~ ~
/// ```
///
/// Placeholders: `{viewer}`, `{name}`, `{gift}`, `{count}`, `{total}`,
/// `{iteration}`, `{repetitions}`, `{target}`, `{broadcaster}`. Use `{{` and
/// `}}` for literal braces.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateCompiler;

impl ScriptCompiler for TemplateCompiler {
	fn compile(&self, source: &str) -> Result<Arc<dyn ActionRunner>, CompileError> {
		if source.trim().is_empty() {
			return Err(CompileError::new("code is empty"));
		}

		let mut steps = Vec::new();
		for (idx, raw) in source.lines().enumerate() {
			let line = raw.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			let lineno = idx + 1;
			if let Some(rest) = line.strip_prefix("@log") {
				if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
					return Err(CompileError::at_line(lineno, format!("unknown directive: {line}")));
				}
				steps.push(Step::Log(parse_segments(rest.trim_start(), lineno)?));
			} else if line.starts_with('@') {
				return Err(CompileError::at_line(lineno, format!("unknown directive: {line}")));
			} else {
				steps.push(Step::Command(parse_segments(line, lineno)?));
			}
		}

		if steps.is_empty() {
			return Err(CompileError::new("code is empty"));
		}

		Ok(Arc::new(TemplateRunner { steps }))
	}
}

fn parse_segments(line: &str, lineno: usize) -> Result<Vec<Segment>, CompileError> {
	let mut segments = Vec::new();
	let mut text = String::new();
	let mut chars = line.chars().peekable();

	while let Some(c) = chars.next() {
		match c {
			'{' if chars.peek() == Some(&'{') => {
				chars.next();
				text.push('{');
			}
			'}' if chars.peek() == Some(&'}') => {
				chars.next();
				text.push('}');
			}
			'{' => {
				let mut name = String::new();
				let mut closed = false;
				for c in chars.by_ref() {
					if c == '}' {
						closed = true;
						break;
					}
					if c == '{' {
						break;
					}
					name.push(c);
				}
				if !closed {
					return Err(CompileError::at_line(lineno, "unbalanced '{'"));
				}
				let Some(var) = Placeholder::parse(&name) else {
					return Err(CompileError::at_line(lineno, format!("unknown placeholder {{{name}}}")));
				};
				if !text.is_empty() {
					segments.push(Segment::Text(std::mem::take(&mut text)));
				}
				segments.push(Segment::Var(var));
			}
			'}' => return Err(CompileError::at_line(lineno, "unbalanced '}'")),
			c => text.push(c),
		}
	}

	if !text.is_empty() {
		segments.push(Segment::Text(text));
	}
	Ok(segments)
}

struct TemplateRunner {
	steps: Vec<Step>,
}

fn render(segments: &[Segment], event: &NormalizedEvent, ctx: &ScriptContext<'_>) -> String {
	let mut out = String::new();
	for seg in segments {
		match seg {
			Segment::Text(t) => out.push_str(t),
			Segment::Var(v) => v.render(event, ctx, &mut out),
		}
	}
	out
}

#[async_trait]
impl ActionRunner for TemplateRunner {
	async fn run(&self, event: &NormalizedEvent, ctx: &mut ScriptContext<'_>) -> Result<Value, ExecutionError> {
		let mut responses = Vec::new();
		for step in &self.steps {
			match step {
				Step::Log(segments) => {
					let line = render(segments, event, ctx);
					ctx.log(line);
				}
				Step::Command(segments) => {
					let command = render(segments, event, ctx);
					let response = ctx.console.send(&command).await?;
					ctx.log(format!("> {command}"));
					if !response.trim().is_empty() {
						ctx.log(response.clone());
					}
					responses.push(Value::String(response));
				}
			}
		}
		Ok(Value::Array(responses))
	}
}
