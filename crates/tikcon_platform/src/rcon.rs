#![forbid(unsafe_code)]

//! Source RCON client over TCP.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tikcon_protocol::{
	AUTH_FAILED_ID, DEFAULT_MAX_PAYLOAD_SIZE, Packet, encode_packet_into, packet_type, try_decode_packet_from_buffer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::{ConsoleCredentials, ConsoleSession, ConsoleTransport, TransportError};

#[derive(Debug, Clone)]
pub struct RconConfig {
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
	pub max_payload_size: usize,
}

impl Default for RconConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(5),
			request_timeout: Duration::from_secs(5),
			max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
		}
	}
}

/// Connects authenticated RCON sessions.
#[derive(Debug, Clone, Default)]
pub struct RconTransport {
	cfg: RconConfig,
}

impl RconTransport {
	pub fn new(cfg: RconConfig) -> Self {
		Self { cfg }
	}
}

#[async_trait]
impl ConsoleTransport for RconTransport {
	async fn connect(&self, credentials: &ConsoleCredentials) -> Result<Box<dyn ConsoleSession>, TransportError> {
		let addr = format!("{}:{}", credentials.host, credentials.port);
		let stream = tokio::time::timeout(self.cfg.connect_timeout, TcpStream::connect(&addr))
			.await
			.map_err(|_| TransportError::Timeout(self.cfg.connect_timeout))?
			.map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
		let _ = stream.set_nodelay(true);

		let mut session = RconSession {
			stream,
			buf: BytesMut::with_capacity(1024),
			next_id: 1,
			cfg: self.cfg.clone(),
			closed: false,
		};

		tokio::time::timeout(self.cfg.request_timeout, session.authenticate(credentials.password.expose()))
			.await
			.map_err(|_| TransportError::Timeout(self.cfg.request_timeout))??;

		info!(%addr, "rcon session authenticated");
		Ok(Box::new(session))
	}
}

pub struct RconSession {
	stream: TcpStream,
	buf: BytesMut,
	next_id: i32,
	cfg: RconConfig,
	closed: bool,
}

impl RconSession {
	fn take_id(&mut self) -> i32 {
		let id = self.next_id;
		self.next_id = if self.next_id >= i32::MAX { 1 } else { self.next_id + 1 };
		id
	}

	async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
		let mut out = BytesMut::new();
		encode_packet_into(&mut out, packet, self.cfg.max_payload_size)?;
		self.stream.write_all(&out).await?;
		Ok(())
	}

	async fn read_packet(&mut self) -> Result<Packet, TransportError> {
		loop {
			if let Some(packet) = try_decode_packet_from_buffer(&mut self.buf, self.cfg.max_payload_size)? {
				return Ok(packet);
			}

			let n = self.stream.read_buf(&mut self.buf).await?;
			if n == 0 {
				return Err(TransportError::Closed);
			}
		}
	}

	async fn authenticate(&mut self, password: &str) -> Result<(), TransportError> {
		let id = self.take_id();
		self.write_packet(&Packet::new(id, packet_type::AUTH, password)).await?;

		loop {
			let packet = self.read_packet().await?;
			// Some servers send an empty RESPONSE_VALUE ahead of the auth response.
			if packet.kind != packet_type::AUTH_RESPONSE {
				continue;
			}
			if packet.id == AUTH_FAILED_ID {
				return Err(TransportError::Auth("server rejected rcon password".to_string()));
			}
			if packet.id == id {
				return Ok(());
			}
			return Err(TransportError::Protocol(format!("unexpected auth response id {}", packet.id)));
		}
	}

	async fn exec(&mut self, command: &str) -> Result<String, TransportError> {
		let id = self.take_id();
		self.write_packet(&Packet::new(id, packet_type::EXEC_COMMAND, command))
			.await?;

		loop {
			let packet = self.read_packet().await?;
			if packet.id == id && packet.kind == packet_type::RESPONSE_VALUE {
				return Ok(packet.body);
			}
			debug!(id = packet.id, kind = packet.kind, "skipping unrelated rcon packet");
		}
	}
}

#[async_trait]
impl ConsoleSession for RconSession {
	async fn send(&mut self, command: &str) -> Result<String, TransportError> {
		if self.closed {
			return Err(TransportError::Closed);
		}

		match tokio::time::timeout(self.cfg.request_timeout, self.exec(command)).await {
			Ok(res) => res,
			Err(_) => Err(TransportError::Timeout(self.cfg.request_timeout)),
		}
	}

	async fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		let _ = self.stream.shutdown().await;
	}
}
