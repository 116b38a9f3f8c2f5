#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tikcon_domain::ActionConfig;
use tikcon_engine::{BridgeConfig, TimingConfig};
use tikcon_platform::{ConsoleCredentials, DEFAULT_CONSOLE_PORT, SecretString, StreamCredentials};
use tracing::{info, warn};
use url::Url;

/// Default config path: `~/.tikcon/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tikcon").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Process configuration: the reloadable bridge payload plus process-level settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub relay: RelaySettings,
	pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Answer console commands locally instead of talking to the game server.
	pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub url: Option<Url>,
	pub handshake_timeout: Duration,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			url: None,
			handshake_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	stream: FileStreamSettings,

	#[serde(default)]
	console: FileConsoleSettings,

	target_player: Option<String>,
	log_capacity: Option<usize>,

	#[serde(default)]
	timing: TimingConfig,

	#[serde(default)]
	actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	dry_run: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	url: Option<String>,
	handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStreamSettings {
	broadcaster: Option<String>,
	session_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConsoleSettings {
	host: Option<String>,
	port: Option<u16>,
	password: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let url = match file.relay.url.filter(|s| !s.trim().is_empty()) {
			Some(raw) => Some(Url::parse(raw.trim()).with_context(|| format!("relay.url {raw:?} is not a valid URL"))?),
			None => None,
		};

		let default_console = ConsoleCredentials::default();
		let bridge = BridgeConfig {
			stream: StreamCredentials {
				broadcaster: file.stream.broadcaster.unwrap_or_default().trim().to_string(),
				session_token: file
					.stream
					.session_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			console: ConsoleCredentials {
				host: file
					.console
					.host
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(default_console.host),
				port: file.console.port.unwrap_or(DEFAULT_CONSOLE_PORT),
				password: file.console.password.map(SecretString::new).unwrap_or_default(),
			},
			target_player: file.target_player.unwrap_or_default(),
			actions: file.actions,
			timing: file.timing,
			log_capacity: file.log_capacity.unwrap_or(BridgeConfig::default().log_capacity),
		};

		Ok(Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				dry_run: file.server.dry_run.unwrap_or(false),
			},
			relay: RelaySettings {
				url,
				handshake_timeout: file
					.relay
					.handshake_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(RelaySettings::default().handshake_timeout),
			},
			bridge,
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn parse_toml(raw: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(raw).context("parse TOML")
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `TIKCON_*` overrides read through `lookup`.
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("TIKCON_BROADCASTER") {
		cfg.bridge.stream.broadcaster = v;
		info!("stream config: broadcaster overridden by env");
	}

	if let Some(v) = non_empty("TIKCON_SESSION_TOKEN") {
		cfg.bridge.stream.session_token = Some(SecretString::new(v));
		info!("stream config: session_token overridden by env");
	}

	if let Some(v) = non_empty("TIKCON_CONSOLE_HOST") {
		cfg.bridge.console.host = v;
		info!("console config: host overridden by env");
	}

	if let Some(v) = non_empty("TIKCON_CONSOLE_PORT") {
		match v.parse::<u16>() {
			Ok(port) => {
				cfg.bridge.console.port = port;
				info!(port, "console config: port overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "ignoring invalid TIKCON_CONSOLE_PORT"),
		}
	}

	if let Some(v) = non_empty("TIKCON_CONSOLE_PASSWORD") {
		cfg.bridge.console.password = SecretString::new(v);
		info!("console config: password overridden by env");
	}

	if let Some(v) = non_empty("TIKCON_TARGET_PLAYER") {
		cfg.bridge.target_player = v;
		info!("bridge config: target_player overridden by env");
	}

	if let Some(v) = non_empty("TIKCON_RELAY_URL") {
		match Url::parse(&v) {
			Ok(url) => {
				cfg.relay.url = Some(url);
				info!("relay config: url overridden by env");
			}
			Err(e) => warn!(error = %e, "ignoring invalid TIKCON_RELAY_URL"),
		}
	}

	if let Some(v) = non_empty("TIKCON_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("TIKCON_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = lookup("TIKCON_DRY_RUN")
		&& let Some(dry_run) = parse_env_bool(&v)
	{
		cfg.server.dry_run = dry_run;
		info!(dry_run, "server config: dry_run overridden by env");
	}

	if cfg.bridge.stream.broadcaster.is_empty() {
		warn!("stream config: no broadcaster configured; engine will stay idle");
	}
}
