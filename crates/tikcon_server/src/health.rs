#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tikcon_engine::ConnectionState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::warn;

/// Readiness follows the engine's stream state.
#[derive(Clone)]
pub struct HealthState {
	state_rx: watch::Receiver<ConnectionState>,
}

impl HealthState {
	pub fn new(state_rx: watch::Receiver<ConnectionState>) -> Self {
		Self { state_rx }
	}

	pub fn state(&self) -> ConnectionState {
		*self.state_rx.borrow()
	}

	pub fn is_ready(&self) -> bool {
		self.state() == ConnectionState::Connected
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			let body = serde_json::to_vec(&state.state()).map(Bytes::from).unwrap_or_default();
			let status = if state.is_ready() {
				StatusCode::OK
			} else {
				StatusCode::SERVICE_UNAVAILABLE
			};
			respond(status, body)
		}
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}
