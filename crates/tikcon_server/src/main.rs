#![forbid(unsafe_code)]

mod adapters;
mod config;
mod health;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use tikcon_engine::{Engine, EngineError, TemplateCompiler};
use tikcon_platform::relay::{RelayConfig, RelayTransport};
use tikcon_platform::rcon::{RconConfig, RconTransport};
use tikcon_platform::{ConsoleTransport, StreamTransport};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::health::{HealthState, spawn_health_server};

/// Dev-only demo stream enable flag.
const TIKCON_ENABLE_DEMO_STREAM_ENV: &str = "TIKCON_ENABLE_DEMO_STREAM";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tikcon_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.tikcon/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter =
		std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tikcon_server=debug,tikcon_engine=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tikcon_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn demo_stream_enabled() -> bool {
	cfg!(debug_assertions)
		&& std::env::var(TIKCON_ENABLE_DEMO_STREAM_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false)
}

fn build_stream(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn StreamTransport>> {
	if demo_stream_enabled() {
		info!(env = TIKCON_ENABLE_DEMO_STREAM_ENV, "using dev-only demo stream (enabled by env)");
		return Ok(Arc::new(adapters::DemoStream::new()));
	}

	let Some(url) = cfg.relay.url.clone() else {
		return Err(anyhow!("relay.url is not configured (set it in the config file or TIKCON_RELAY_URL)"));
	};
	info!(url = %url, "using websocket relay stream");
	let mut relay_cfg = RelayConfig::new(url);
	relay_cfg.handshake_timeout = cfg.relay.handshake_timeout;
	Ok(Arc::new(RelayTransport::new(relay_cfg)))
}

fn build_console(cfg: &ServerConfig) -> Arc<dyn ConsoleTransport> {
	if cfg.server.dry_run {
		info!("dry-run console: commands are logged, not sent");
		return Arc::new(adapters::DryRunConsole);
	}

	let timeout = cfg.bridge.timing.console_connect_timeout();
	Arc::new(RconTransport::new(RconConfig {
		connect_timeout: timeout,
		request_timeout: timeout,
		..RconConfig::default()
	}))
}

/// SIGHUP on unix; never fires elsewhere.
struct Hangup {
	#[cfg(unix)]
	signal: tokio::signal::unix::Signal,
}

impl Hangup {
	#[cfg(unix)]
	fn new() -> std::io::Result<Self> {
		use tokio::signal::unix::{SignalKind, signal};
		Ok(Self {
			signal: signal(SignalKind::hangup())?,
		})
	}

	#[cfg(not(unix))]
	fn new() -> std::io::Result<Self> {
		Ok(Self {})
	}

	#[cfg(unix)]
	async fn recv(&mut self) -> Option<()> {
		self.signal.recv().await
	}

	#[cfg(not(unix))]
	async fn recv(&mut self) -> Option<()> {
		std::future::pending().await
	}
}

async fn reload_from(path: &std::path::Path, engine: &Engine) {
	let cfg = match crate::config::load_server_config_from_path(path) {
		Ok(cfg) => cfg,
		Err(e) => {
			error!(error = %e, path = %path.display(), "config reload failed; keeping current config");
			return;
		}
	};

	match engine.reload(cfg.bridge).await {
		Ok(()) => {
			metrics::counter!("tikcon_config_reloads_total").increment(1);
			info!(path = %path.display(), "config reloaded");
			if !engine.is_running().await
				&& let Err(e) = engine.start().await
			{
				warn!(error = %e, "engine not started after reload");
			}
		}
		Err(e) => error!(error = %e, "config reload rejected; keeping current config"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let stream = build_stream(&server_cfg)?;
	let console = build_console(&server_cfg);
	let engine = Engine::new(server_cfg.bridge.clone(), stream, console, Arc::new(TemplateCompiler))?;

	let compile_errors = engine.actions().iter().filter(|a| a.compile_error.is_some()).count();
	if compile_errors > 0 {
		warn!(compile_errors, "some actions failed to compile and will be skipped");
	}

	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, HealthState::new(engine.subscribe_state()));
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	match engine.start().await {
		Ok(()) => info!(broadcaster = %server_cfg.bridge.stream.broadcaster, "tikcon_server: engine started"),
		Err(EngineError::MissingBroadcaster) => {
			warn!("tikcon_server: no broadcaster configured; waiting for a config reload (SIGHUP)");
		}
		Err(e) => return Err(e.into()),
	}

	let mut hangup = Hangup::new()?;
	loop {
		tokio::select! {
			res = tokio::signal::ctrl_c() => {
				if let Err(e) = res {
					warn!(error = %e, "ctrl-c handler failed");
				}
				info!("shutdown requested");
				break;
			}
			Some(()) = hangup.recv() => {
				info!(path = %config_path.display(), "SIGHUP received; reloading config");
				reload_from(&config_path, &engine).await;
			}
		}
	}

	engine.stop().await;
	info!("tikcon_server stopped");
	Ok(())
}
