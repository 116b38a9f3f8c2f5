#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tikcon_platform::{ConsoleCredentials, ConsoleSession, ConsoleTransport, TransportError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::script::Console;

/// Holds the single shared control-channel session.
///
/// The session is connected lazily and cached. A failed send drops it so the
/// next command reconnects; failures are returned to the caller and never
/// retried here.
pub struct ConsoleGateway {
	transport: Arc<dyn ConsoleTransport>,
	session: Mutex<Option<Box<dyn ConsoleSession>>>,
	connect_timeout: Duration,
}

impl ConsoleGateway {
	pub fn new(transport: Arc<dyn ConsoleTransport>, connect_timeout: Duration) -> Self {
		Self {
			transport,
			session: Mutex::new(None),
			connect_timeout,
		}
	}

	async fn connect(&self, credentials: &ConsoleCredentials) -> Result<Box<dyn ConsoleSession>, TransportError> {
		metrics::counter!("tikcon_console_connect_attempts_total").increment(1);
		let session = tokio::time::timeout(self.connect_timeout, self.transport.connect(credentials))
			.await
			.map_err(|_| TransportError::Timeout(self.connect_timeout))??;
		info!(host = %credentials.host, port = credentials.port, "console session established");
		Ok(session)
	}

	/// Return a handle to the cached session, connecting first if needed.
	pub async fn ensure_connected(&self, credentials: &ConsoleCredentials) -> Result<ConsoleHandle<'_>, TransportError> {
		let mut guard = self.session.lock().await;
		if guard.is_none() {
			*guard = Some(self.connect(credentials).await?);
		}
		Ok(self.handle(credentials))
	}

	/// Return a handle that connects on its first command.
	pub fn handle(&self, credentials: &ConsoleCredentials) -> ConsoleHandle<'_> {
		ConsoleHandle {
			gateway: self,
			credentials: credentials.clone(),
		}
	}

	/// Send one command over the cached session.
	///
	/// The session lock is held for this command only, so sends from concurrent
	/// runs are serialized without any run holding the session in between.
	async fn send(&self, credentials: &ConsoleCredentials, command: &str) -> Result<String, TransportError> {
		let mut guard = self.session.lock().await;
		if guard.is_none() {
			*guard = Some(self.connect(credentials).await?);
		}
		let Some(session) = guard.as_mut() else {
			return Err(TransportError::Closed);
		};

		match session.send(command).await {
			Ok(response) => Ok(response),
			Err(e) => {
				warn!(error = %e, command, "console send failed; dropping session");
				if let Some(mut broken) = guard.take() {
					broken.close().await;
				}
				Err(e)
			}
		}
	}

	pub async fn is_connected(&self) -> bool {
		self.session.lock().await.is_some()
	}

	/// Close the cached session, if any.
	pub async fn disconnect(&self) {
		let session = self.session.lock().await.take();
		if let Some(mut session) = session {
			session.close().await;
			info!("console session closed");
		} else {
			debug!("console disconnect: no session");
		}
	}
}

/// Console view of the gateway for one action run.
pub struct ConsoleHandle<'a> {
	gateway: &'a ConsoleGateway,
	credentials: ConsoleCredentials,
}

#[async_trait]
impl<'a> Console for ConsoleHandle<'a> {
	async fn send(&mut self, command: &str) -> Result<String, TransportError> {
		self.gateway.send(&self.credentials, command).await
	}
}
