//! The protocol module contract: one object per module (`secure`, `pcp`,
//! `http`, `redis`), invoked by the core at fixed points in a client's
//! lifecycle.
//!
//! Full protocol parsing (PCP PDU framing, HTTP method/header parsing, RESP
//! decoding) is out of scope for this crate; the `Pcp`/`Http`/`Redis` modules
//! here are thin pass-throughs that demonstrate and exercise the contract the
//! way a real handler would plug into it. The `secure` module is the one
//! module whose body does real work, since TLS pass-through lives in the
//! read demultiplexer.
//!
//! Object-safety and the `Send + Sync + 'static` bound mirror an object-safe
//! storage-backend trait pattern.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{classify::PlaintextProtocol, client::Client, proxy::Proxy, write::WriteRequest};

/// A protocol module: `setup`/`on_client_read`/`on_client_close`/`close`.
#[async_trait]
pub trait ProtocolModule: Debug + Send + Sync {
	/// Invoked once, after the loop has started, in the fixed module order
	/// secure → redis → http → pcp.
	async fn setup(&self, proxy: &Proxy);

	/// Invoked for each classified inbound buffer belonging to a client
	/// whose mask contains this module's tag. Must tolerate partial and
	/// concatenated frames; this crate delivers whatever bytes a single read
	/// produced, with no framing guarantees.
	async fn on_client_read(&self, proxy: &Proxy, client: &Arc<Client>, buf: &[u8]);

	/// Invoked exactly once per client whose mask contained this module's
	/// bit at the moment of destruction, even if the client was never
	/// actually read from by this module (e.g. a TLS client whose handshake
	/// never completed).
	fn on_client_close(&self, client: &Client);

	/// Invoked at shutdown; must release all module-wide resources.
	async fn close(&self, proxy: &Proxy);
}

/// The additional contract implemented by the `secure` module: a
/// bidirectional filter between the socket and the plaintext demultiplexer.
#[async_trait]
pub trait TlsModule: ProtocolModule {
	/// Flush any pending TLS output produced by handshake or key-update
	/// state changes. Invoked immediately before and after every read, and
	/// after every write.
	async fn flush(&self, proxy: &Proxy, client: &Arc<Client>);

	/// Feed raw ciphertext bytes in; return zero or more plaintext chunks
	/// produced as a result. The demultiplexer re-enters classification with
	/// each chunk.
	async fn unwrap(&self, client: &Arc<Client>, ciphertext: &[u8]) -> Vec<Vec<u8>>;

	/// Encrypt a plaintext [`WriteRequest`] into one ready for submission to
	/// the underlying socket.
	async fn wrap(&self, client: &Arc<Client>, request: WriteRequest) -> WriteRequest;
}

/// The fixed set of protocol modules known to the core, indexed by tag.
/// Owned by the [`Proxy`] and handed out to the demultiplexer and write
/// submitter.
#[derive(Debug)]
pub struct ModuleRegistry {
	pcp: Arc<dyn ProtocolModule>,
	http: Arc<dyn ProtocolModule>,
	redis: Arc<dyn ProtocolModule>,
	secure: Arc<dyn TlsModule>,
}

impl ModuleRegistry {
	/// Construct a registry from concrete module implementations.
	#[must_use]
	pub fn new(
		pcp: Arc<dyn ProtocolModule>,
		http: Arc<dyn ProtocolModule>,
		redis: Arc<dyn ProtocolModule>,
		secure: Arc<dyn TlsModule>,
	) -> Self {
		Self {
			pcp,
			http,
			redis,
			secure,
		}
	}

	/// A registry of no-op modules, useful for tests that only exercise
	/// client lifecycle/refcount behavior and never expect a module body to
	/// run.
	#[must_use]
	pub fn new_noop() -> Self {
		Self::new(
			Arc::new(crate::modules::pcp::PcpModule::default()),
			Arc::new(crate::modules::http::HttpModule::default()),
			Arc::new(crate::modules::redis::RedisModule::default()),
			Arc::new(crate::modules::secure::SecureModule::disabled()),
		)
	}

	/// Get the plaintext module for a given tag.
	#[must_use]
	pub fn plaintext_for(&self, tag: PlaintextProtocol) -> &Arc<dyn ProtocolModule> {
		match tag {
			PlaintextProtocol::Pcp => &self.pcp,
			PlaintextProtocol::Http => &self.http,
			PlaintextProtocol::Redis => &self.redis,
		}
	}

	/// Get the secure (TLS) module.
	#[must_use]
	pub const fn secure(&self) -> &Arc<dyn TlsModule> {
		&self.secure
	}

	/// Run every module's `setup` hook, in the fixed order secure → redis →
	/// http → pcp.
	pub(crate) async fn setup_all(&self, proxy: &Proxy) {
		self.secure.setup(proxy).await;
		self.redis.setup(proxy).await;
		self.http.setup(proxy).await;
		self.pcp.setup(proxy).await;
	}

	/// Run every module's `close` hook at shutdown.
	pub(crate) async fn close_all(&self, proxy: &Proxy) {
		self.secure.close(proxy).await;
		self.redis.close(proxy).await;
		self.http.close(proxy).await;
		self.pcp.close(proxy).await;
	}
}
