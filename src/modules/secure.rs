//! The secure (TLS) module: a manual, buffer-oriented wrap/unwrap layer over
//! `rustls`, rather than a transparent `AsyncRead`/`AsyncWrite` decorator.
//!
//! Explicit wrap/unwrap hooks fit the read demultiplexer and write submitter
//! better than `tokio_rustls`'s usual stream wrapper would: the read
//! demultiplexer needs `unwrap(ciphertext) -> plaintext chunks` and the write
//! submitter needs `wrap(WriteRequest) -> WriteRequest` as first-class
//! re-entrant operations, not a single opaque stream.

use std::{
	io::{Read, Write},
	sync::{atomic::{AtomicU64, Ordering}, Arc},
};

use async_trait::async_trait;
use tokio_rustls::rustls::{ServerConfig, ServerConnection};
use tracing::{trace, warn};

use crate::{
	client::Client,
	module::{ProtocolModule, TlsModule},
	proxy::Proxy,
	write::WriteRequest,
};

/// The TLS pass-through module. Disabled (via [`SecureModule::disabled`])
/// when no certificate/key pair is configured; in that state, bytes that
/// classify as `SECURE` still latch the bit (so the mask is observable) but
/// no handshake can complete.
#[derive(Debug)]
pub struct SecureModule {
	server_config: Option<Arc<ServerConfig>>,
	handshakes: AtomicU64,
}

impl SecureModule {
	/// Construct an active secure module from a prepared `rustls` server
	/// configuration.
	#[must_use]
	pub fn new(server_config: Arc<ServerConfig>) -> Self {
		Self {
			server_config: Some(server_config),
			handshakes: AtomicU64::new(0),
		}
	}

	/// Construct a disabled secure module: classification still recognizes
	/// `SECURE`, but no handshake can ever complete.
	#[must_use]
	pub const fn disabled() -> Self {
		Self {
			server_config: None,
			handshakes: AtomicU64::new(0),
		}
	}

	fn drain_tls_output(session: &mut ServerConnection) -> Vec<u8> {
		let mut out = Vec::new();
		while session.wants_write() {
			match session.write_tls(&mut out) {
				Ok(0) | Err(_) => break,
				Ok(_) => {}
			}
		}
		out
	}
}

#[async_trait]
impl ProtocolModule for SecureModule {
	async fn setup(&self, _proxy: &Proxy) {
		trace!(enabled = self.server_config.is_some(), "secure module ready");
	}

	// The secure module is never the target of `on_client_read`: `SECURE` is
	// tracked on `ProtocolMask` separately from the plaintext tag, so the
	// demultiplexer always routes to `unwrap` instead.
	async fn on_client_read(&self, _proxy: &Proxy, _client: &Arc<Client>, _buf: &[u8]) {}

	fn on_client_close(&self, client: &Client) {
		trace!(handle = ?client.handle(), "secure client closed");
	}

	async fn close(&self, _proxy: &Proxy) {
		trace!(
			handshakes = self.handshakes.load(Ordering::Relaxed),
			"secure module shut down"
		);
	}
}

#[async_trait]
impl TlsModule for SecureModule {
	async fn flush(&self, proxy: &Proxy, client: &Arc<Client>) {
		let output = client.try_with_tls_session(Self::drain_tls_output);

		if let Some(output) = output {
			if !output.is_empty() {
				proxy.client_write(client, WriteRequest::single(output));
			}
		}
	}

	async fn unwrap(&self, client: &Arc<Client>, ciphertext: &[u8]) -> Vec<Vec<u8>> {
		let Some(server_config) = self.server_config.clone() else {
			return Vec::new();
		};

		self.handshakes.fetch_add(1, Ordering::Relaxed);

		client.with_tls_session(
			|| ServerConnection::new(server_config).expect("valid rustls server configuration"),
			|session| {
				let mut reader = ciphertext;
				if session.read_tls(&mut reader).is_err() {
					return Vec::new();
				}
				if let Err(err) = session.process_new_packets() {
					warn!(handle = ?client.handle(), error = %err, "TLS error, dropping record");
					return Vec::new();
				}

				let mut plaintext = Vec::new();
				let mut buf = [0u8; 4096];
				loop {
					match session.reader().read(&mut buf) {
						Ok(0) => break,
						Ok(n) => plaintext.extend_from_slice(&buf[..n]),
						Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
						Err(_) => break,
					}
				}

				if plaintext.is_empty() {
					Vec::new()
				} else {
					vec![plaintext]
				}
			},
		)
	}

	async fn wrap(&self, client: &Arc<Client>, request: WriteRequest) -> WriteRequest {
		let Some(server_config) = self.server_config.clone() else {
			return request;
		};

		let ciphertext = client.with_tls_session(
			|| ServerConnection::new(server_config).expect("valid rustls server configuration"),
			|session| {
				let _ = session.writer().write_all(&request.primary);
				if let Some(suffix) = &request.suffix {
					let _ = session.writer().write_all(suffix);
				}
				Self::drain_tls_output(session)
			},
		);

		WriteRequest::single(ciphertext)
	}
}
