#![forbid(unsafe_code)]

use async_trait::async_trait;
use tikcon_platform::{ConsoleCredentials, ConsoleSession, ConsoleTransport, TransportError};
use tracing::info;

/// Console that logs commands instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunConsole;

struct DryRunSession {
	target: String,
	sent: u64,
	closed: bool,
}

#[async_trait]
impl ConsoleTransport for DryRunConsole {
	async fn connect(&self, credentials: &ConsoleCredentials) -> Result<Box<dyn ConsoleSession>, TransportError> {
		let target = format!("{}:{}", credentials.host, credentials.port);
		info!(server = %target, "dry-run console session opened");
		Ok(Box::new(DryRunSession {
			target,
			sent: 0,
			closed: false,
		}))
	}
}

#[async_trait]
impl ConsoleSession for DryRunSession {
	async fn send(&mut self, command: &str) -> Result<String, TransportError> {
		if self.closed {
			return Err(TransportError::Closed);
		}
		self.sent += 1;
		info!(server = %self.target, seq = self.sent, %command, "[dry-run] console command");
		Ok(format!("[dry-run] {command}"))
	}

	async fn close(&mut self) {
		if !self.closed {
			self.closed = true;
			info!(server = %self.target, sent = self.sent, "dry-run console session closed");
		}
	}
}
