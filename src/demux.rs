//! The read-side demultiplexer: buffer allocation and the classify-then-
//! dispatch logic that drives every client's read loop.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{trace, warn};

use crate::{
	classify::{classify, Classification},
	client::Client,
	proxy::Proxy,
};

/// Suggested size for each read buffer, passed to the allocator the way a
/// libuv-style read loop hands its callback a suggested size.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// The read half of a client's underlying transport, mirroring [`WriteHalf`].
pub enum ReadHalf {
	/// A TCP connection's read half.
	Tcp(tokio::net::tcp::OwnedReadHalf),
	/// A local socket connection's read half.
	Local(tokio::net::unix::OwnedReadHalf),
}

/// Allocate a receive buffer of the suggested size. Returns a zero-length
/// buffer if allocation fails, signalling to the caller that the read should
/// be skipped this time around rather than propagating an allocation error.
#[must_use]
fn allocate_buffer(size: usize) -> Vec<u8> {
	let mut buf = Vec::new();
	if buf.try_reserve_exact(size).is_err() {
		return Vec::new();
	}
	buf.resize(size, 0);
	buf
}

/// Drive one client's read loop until EOF, a read error, or the client is
/// closed by the dispatcher (e.g. on an unrecognized first byte). Spawned
/// once per accepted connection by the listener.
pub(crate) async fn run_read_loop(proxy: Arc<Proxy>, client: Arc<Client>, mut read_half: ReadHalf) {
	loop {
		let mut buf = allocate_buffer(READ_BUFFER_SIZE);
		if buf.is_empty() {
			warn!(handle = ?client.handle(), "buffer allocation failed, skipping read");
			continue;
		}

		let read = match &mut read_half {
			ReadHalf::Tcp(half) => half.read(&mut buf).await,
			ReadHalf::Local(half) => half.read(&mut buf).await,
		};

		match read {
			Ok(0) => {
				trace!(handle = ?client.handle(), "client reached end of stream");
				client.close();
				break;
			}
			Ok(n) => {
				buf.truncate(n);
				dispatch_read(&proxy, &client, buf).await;
				if !client.is_open() {
					break;
				}
			}
			Err(err) => {
				warn!(handle = ?client.handle(), error = %err, "read error, closing client");
				client.close();
				break;
			}
		}
	}
}

/// Classify and dispatch one buffer read directly off the socket.
///
/// The very first raw byte ever seen for a client determines whether it is
/// `SECURE` or a known plaintext protocol; once `SECURE` is latched it is
/// never cleared, so every raw buffer for the rest of the connection's life
/// — handshake continuation, a pipelined request split across reads, a
/// keep-alive's second request — is ciphertext and must go through the TLS
/// unwrap layer again, regardless of whether a plaintext tag has also
/// latched by then. Only the plaintext chunks `unwrap` itself produces skip
/// a second pass through unwrap; those are handled by
/// [`dispatch_plaintext_chunk`].
pub(crate) async fn dispatch_read(proxy: &Arc<Proxy>, client: &Arc<Client>, buf: Vec<u8>) {
	if buf.is_empty() {
		return;
	}

	if client.mask().is_unknown() && !client.mask().is_secure() {
		match classify(buf[0]) {
			Classification::Plaintext(tag) => client.set_tag(tag),
			Classification::Secure => client.set_secure(),
			Classification::Unknown => {
				client.close();
				return;
			}
		}
	}

	if client.mask().is_secure() {
		let secure = proxy.modules().secure();
		secure.flush(proxy, client).await;
		let chunks = secure.unwrap(client, &buf).await;
		secure.flush(proxy, client).await;
		for chunk in chunks {
			dispatch_plaintext_chunk(proxy, client, chunk).await;
		}
		return;
	}

	dispatch_plaintext_chunk(proxy, client, buf).await;
}

/// Classify (if not already tagged) and dispatch one buffer already known to
/// be plaintext: either a non-`SECURE` client's raw read, or a chunk the
/// secure module's `unwrap` decrypted. Never re-enters the TLS unwrap layer
/// — [`dispatch_read`] is the only caller that knows whether a buffer came
/// straight off the socket.
async fn dispatch_plaintext_chunk(proxy: &Arc<Proxy>, client: &Arc<Client>, buf: Vec<u8>) {
	if buf.is_empty() {
		return;
	}

	if client.mask().tag().is_none() {
		match classify(buf[0]) {
			Classification::Plaintext(tag) => client.set_tag(tag),
			Classification::Secure | Classification::Unknown => {
				client.close();
				return;
			}
		}
	}

	if let Some(tag) = client.mask().tag() {
		proxy
			.modules()
			.plaintext_for(tag)
			.on_client_read(proxy, client, &buf)
			.await;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use async_trait::async_trait;
	use tokio::net::{TcpListener, TcpStream};

	use super::*;
	use crate::{
		classify::PlaintextProtocol,
		client::StreamFamily,
		module::{ModuleRegistry, ProtocolModule, TlsModule},
		proxy::ClientHandle,
		write::WriteRequest,
	};

	#[derive(Debug, Default)]
	struct CountingModule {
		reads: AtomicUsize,
		closes: AtomicUsize,
	}

	#[async_trait]
	impl ProtocolModule for CountingModule {
		async fn setup(&self, _proxy: &Proxy) {}

		async fn on_client_read(&self, _proxy: &Proxy, _client: &Arc<Client>, _buf: &[u8]) {
			self.reads.fetch_add(1, Ordering::SeqCst);
		}

		fn on_client_close(&self, _client: &Client) {
			self.closes.fetch_add(1, Ordering::SeqCst);
		}

		async fn close(&self, _proxy: &Proxy) {}
	}

	#[derive(Debug, Default)]
	struct NoopSecure;

	#[async_trait]
	impl ProtocolModule for NoopSecure {
		async fn setup(&self, _proxy: &Proxy) {}
		async fn on_client_read(&self, _proxy: &Proxy, _client: &Arc<Client>, _buf: &[u8]) {}
		fn on_client_close(&self, _client: &Client) {}
		async fn close(&self, _proxy: &Proxy) {}
	}

	#[async_trait]
	impl TlsModule for NoopSecure {
		async fn flush(&self, _proxy: &Proxy, _client: &Arc<Client>) {}

		async fn unwrap(&self, _client: &Arc<Client>, ciphertext: &[u8]) -> Vec<Vec<u8>> {
			vec![ciphertext.to_vec()]
		}

		async fn wrap(&self, _client: &Arc<Client>, request: WriteRequest) -> WriteRequest {
			request
		}
	}

	#[derive(Debug, Default)]
	struct CountingSecure {
		unwraps: AtomicUsize,
	}

	#[async_trait]
	impl ProtocolModule for CountingSecure {
		async fn setup(&self, _proxy: &Proxy) {}
		async fn on_client_read(&self, _proxy: &Proxy, _client: &Arc<Client>, _buf: &[u8]) {}
		fn on_client_close(&self, _client: &Client) {}
		async fn close(&self, _proxy: &Proxy) {}
	}

	#[async_trait]
	impl TlsModule for CountingSecure {
		async fn flush(&self, _proxy: &Proxy, _client: &Arc<Client>) {}

		// Every call "decrypts" its input by stripping a one-byte TLS record
		// header, mimicking a real unwrap layer closely enough to tell
		// whether a given buffer reached it.
		async fn unwrap(&self, _client: &Arc<Client>, ciphertext: &[u8]) -> Vec<Vec<u8>> {
			self.unwraps.fetch_add(1, Ordering::SeqCst);
			if ciphertext.len() <= 1 {
				return Vec::new();
			}
			vec![ciphertext[1..].to_vec()]
		}

		async fn wrap(&self, _client: &Arc<Client>, request: WriteRequest) -> WriteRequest {
			request
		}
	}

	async fn test_client_and_proxyless() -> Arc<Client> {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (accepted, _connector) = tokio::join!(listener.accept(), TcpStream::connect(addr));
		let (_read_half, write_half) = accepted.unwrap().0.into_split();

		Client::new(
			ClientHandle(0),
			StreamFamily::Tcp4,
			"127.0.0.1".to_string(),
			0,
			crate::client::WriteHalf::Tcp(write_half),
			Arc::new(ModuleRegistry::new_noop()),
			std::sync::Weak::new(),
		)
	}

	fn registry_with(http: Arc<CountingModule>) -> Arc<ModuleRegistry> {
		Arc::new(ModuleRegistry::new(
			Arc::new(crate::modules::pcp::PcpModule::default()),
			http,
			Arc::new(crate::modules::redis::RedisModule::default()),
			Arc::new(NoopSecure),
		))
	}

	#[tokio::test]
	async fn http_byte_dispatches_to_http_module() {
		let http = Arc::new(CountingModule::default());
		let client = test_client_and_proxyless().await;

		// swap in a registry whose http module we can observe; dispatch_read
		// only needs `proxy.modules()`, so a `Proxy` isn't required for this
		// unit test beyond satisfying the type.
		let modules = registry_with(Arc::clone(&http));
		let proxy = test_proxy(modules);

		dispatch_read(&proxy, &client, b"GET / HTTP/1.1\r\n\r\n".to_vec()).await;

		assert_eq!(http.reads.load(Ordering::SeqCst), 1);
		assert_eq!(client.mask().tag(), Some(PlaintextProtocol::Http));
	}

	#[tokio::test]
	async fn unknown_byte_closes_without_dispatch() {
		let http = Arc::new(CountingModule::default());
		let client = test_client_and_proxyless().await;
		let modules = registry_with(Arc::clone(&http));
		let proxy = test_proxy(modules);

		dispatch_read(&proxy, &client, vec![0x00]).await;

		assert_eq!(http.reads.load(Ordering::SeqCst), 0);
		assert!(!client.is_open());
	}

	#[tokio::test]
	async fn empty_buffer_is_a_no_op() {
		let http = Arc::new(CountingModule::default());
		let client = test_client_and_proxyless().await;
		let modules = registry_with(Arc::clone(&http));
		let proxy = test_proxy(modules);

		dispatch_read(&proxy, &client, Vec::new()).await;

		assert_eq!(http.reads.load(Ordering::SeqCst), 0);
		assert!(client.is_open());
		assert!(client.mask().is_unknown());
	}

	#[tokio::test]
	async fn secure_client_unwraps_every_raw_read_even_after_tag_latches() {
		let http = Arc::new(CountingModule::default());
		let secure = Arc::new(CountingSecure::default());
		let client = test_client_and_proxyless().await;
		let modules = Arc::new(ModuleRegistry::new(
			Arc::new(crate::modules::pcp::PcpModule::default()),
			Arc::clone(&http),
			Arc::new(crate::modules::redis::RedisModule::default()),
			Arc::clone(&secure),
		));
		let proxy = test_proxy(modules);

		// first raw read: a TLS record header byte, latching SECURE.
		dispatch_read(&proxy, &client, vec![0x16, b'G']).await;
		assert!(client.mask().is_secure());
		assert_eq!(secure.unwraps.load(Ordering::SeqCst), 1);

		// the decrypted chunk latches the HTTP tag via the second-layer
		// classify, and is dispatched without a second unwrap pass.
		assert_eq!(client.mask().tag(), Some(PlaintextProtocol::Http));
		assert_eq!(http.reads.load(Ordering::SeqCst), 1);

		// a second raw ciphertext buffer, arriving after the tag has
		// latched, must still be routed through unwrap rather than
		// forwarded straight to the HTTP module as raw ciphertext.
		dispatch_read(&proxy, &client, vec![0x17, b'E']).await;
		assert_eq!(secure.unwraps.load(Ordering::SeqCst), 2);
		assert_eq!(http.reads.load(Ordering::SeqCst), 2);
	}

	fn test_proxy(modules: Arc<ModuleRegistry>) -> Arc<Proxy> {
		Proxy::new_for_tests(modules)
	}
}
