//! The Write Submitter: a cross-thread write path that accepts
//! [`WriteRequest`] submissions from any producer and issues them on the
//! client's own write half from a single dedicated dispatcher task.
//!
//! The cross-thread queue is a `crossbeam_channel` MPSC, grounded in
//! `links::config`'s own use of `crossbeam_channel::{unbounded, Sender,
//! Receiver}` for its certificate-update channel. A single channel already
//! preserves one producer's submission order for one client, so per-client
//! FIFO falls out of the channel's own ordering guarantee without needing a
//! separate queue per client.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

use crate::{client::Client, proxy::Proxy};

/// A queued write: one or two buffers bound for one client's transport.
#[derive(Debug)]
pub struct WriteRequest {
	/// The primary payload.
	pub primary: Vec<u8>,
	/// An optional suffix payload, written immediately after `primary`.
	pub suffix: Option<Vec<u8>>,
}

impl WriteRequest {
	/// Construct a request carrying a single buffer.
	#[must_use]
	pub const fn single(primary: Vec<u8>) -> Self {
		Self {
			primary,
			suffix: None,
		}
	}

	/// Construct a request carrying a primary buffer plus a suffix.
	#[must_use]
	pub const fn with_suffix(primary: Vec<u8>, suffix: Vec<u8>) -> Self {
		Self {
			primary,
			suffix: Some(suffix),
		}
	}
}

struct WriteJob {
	client: Arc<Client>,
	request: WriteRequest,
}

/// The cross-thread write submission vehicle, owned by one [`Proxy`].
#[derive(Debug)]
pub struct WriteSubmitter {
	sender: Sender<WriteJob>,
	receiver: Receiver<WriteJob>,
}

impl WriteSubmitter {
	/// Construct a new, unstarted submitter. Call
	/// [`spawn_dispatcher`](Self::spawn_dispatcher) once the owning `Proxy` is
	/// available to begin draining submissions.
	#[must_use]
	pub fn new() -> Self {
		let (sender, receiver) = unbounded();
		Self { sender, receiver }
	}

	/// Submit a write for `client`. Discarded without error if the client's
	/// refcount has already dropped to zero.
	///
	/// Takes a logical reference via [`Client::try_get`] for the lifetime of
	/// the queued job, released by `dispatch_one` once the write has been
	/// issued (or skipped). Without this, a write submitted from one thread
	/// could race a `close()` on another (e.g. the read loop hitting EOF):
	/// the close's module `on_client_close` hook would fire immediately,
	/// while the still-queued write is silently dropped later — the module
	/// is told the client is gone while a write it may still care about is
	/// in flight. Holding a reference across the queue delays that
	/// notification until this write has actually been attempted.
	pub fn submit(&self, client: Arc<Client>, request: WriteRequest) {
		let Some(client) = client.try_get() else {
			return;
		};

		if self.sender.send(WriteJob { client, request }).is_err() {
			warn!("write submitted after dispatcher shut down, dropping");
		}
	}

	/// Spawn the dedicated dispatcher that drains submissions and issues them
	/// on each client's write half, wrapping through the secure module first
	/// when the client is TLS-wrapped.
	///
	/// `crossbeam_channel::Receiver::recv` is a blocking call, so draining it
	/// runs on a `spawn_blocking` thread rather than an async task. Each
	/// drained job is awaited to completion with `Handle::block_on` *before*
	/// the next `recv`, rather than fanned out with `Handle::spawn`: the
	/// latter would let two jobs for the same client race independently
	/// through `Client::write_buffers`'s `AsyncMutex`, whichever task's
	/// waker fires first, breaking the per-client submission-order guarantee.
	/// Serializing the drain loop reproduces the single loop-thread
	/// dispatcher this crate's concurrency model otherwise relies on a
	/// single thread to provide for free.
	pub(crate) fn spawn_dispatcher(&self, proxy: Arc<Proxy>) {
		let receiver = self.receiver.clone();
		let runtime = tokio::runtime::Handle::current();

		tokio::task::spawn_blocking(move || {
			while let Ok(job) = receiver.recv() {
				runtime.block_on(dispatch_one(&proxy, job));
			}
		});
	}
}

impl Default for WriteSubmitter {
	fn default() -> Self {
		Self::new()
	}
}

async fn dispatch_one(proxy: &Arc<Proxy>, job: WriteJob) {
	let WriteJob { client, request } = job;

	if !client.is_open() {
		client.put();
		return;
	}

	let request = if client.mask().is_secure() {
		proxy.modules().secure().wrap(&client, request).await
	} else {
		request
	};

	let result = client
		.write_buffers(&request.primary, request.suffix.as_deref())
		.await;

	if client.mask().is_secure() {
		proxy.modules().secure().flush(proxy, &client).await;
	}

	if let Err(err) = result {
		warn!(handle = ?client.handle(), error = %err, "write error, closing client");
		client.close();
	}

	client.put();
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Weak,
	};

	use async_trait::async_trait;
	use tokio::{
		io::AsyncReadExt,
		net::{TcpListener, TcpStream},
	};

	use super::*;
	use crate::{
		classify::PlaintextProtocol,
		client::StreamFamily,
		module::{ModuleRegistry, ProtocolModule},
		proxy::ClientHandle,
	};

	#[derive(Debug, Default)]
	struct ClosingCountModule {
		closes: AtomicUsize,
	}

	#[async_trait]
	impl ProtocolModule for ClosingCountModule {
		async fn setup(&self, _proxy: &Proxy) {}
		async fn on_client_read(&self, _proxy: &Proxy, _client: &Arc<Client>, _buf: &[u8]) {}

		fn on_client_close(&self, _client: &Client) {
			self.closes.fetch_add(1, Ordering::SeqCst);
		}

		async fn close(&self, _proxy: &Proxy) {}
	}

	#[test]
	fn single_request_has_no_suffix() {
		let request = WriteRequest::single(b"hello".to_vec());
		assert_eq!(request.primary, b"hello");
		assert!(request.suffix.is_none());
	}

	#[test]
	fn with_suffix_keeps_both_buffers() {
		let request = WriteRequest::with_suffix(b"a".to_vec(), b"b".to_vec());
		assert_eq!(request.primary, b"a");
		assert_eq!(request.suffix.as_deref(), Some(b"b".as_slice()));
	}

	#[tokio::test]
	async fn submissions_from_one_producer_arrive_in_order() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (accepted, connector) = tokio::join!(listener.accept(), TcpStream::connect(addr));
		let mut reader = connector.unwrap();
		let (_server_read_half, server_write_half) = accepted.unwrap().0.into_split();

		let client = Client::new(
			ClientHandle(0),
			StreamFamily::Tcp4,
			"127.0.0.1".to_string(),
			0,
			crate::client::WriteHalf::Tcp(server_write_half),
			Arc::new(ModuleRegistry::new_noop()),
			Weak::new(),
		);

		let proxy = Proxy::new_for_tests(Arc::new(ModuleRegistry::new_noop()));
		proxy.write_submitter().spawn_dispatcher(Arc::clone(&proxy));

		// submit 50 single-byte writes from one producer; regardless of how
		// the dispatcher thread schedules against the Tokio runtime, they
		// must land on the wire in this exact order.
		for i in 0..50u8 {
			proxy
				.write_submitter()
				.submit(Arc::clone(&client), WriteRequest::single(vec![i]));
		}

		let mut received = [0u8; 50];
		tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_exact(&mut received))
			.await
			.expect("dispatcher should deliver all 50 writes promptly")
			.expect("read_exact should not error");

		let expected: Vec<u8> = (0..50u8).collect();
		assert_eq!(received.to_vec(), expected);
	}

	#[tokio::test]
	async fn close_during_in_flight_write_defers_on_client_close() {
		let http = Arc::new(ClosingCountModule::default());
		let modules = Arc::new(ModuleRegistry::new(
			Arc::new(crate::modules::pcp::PcpModule::default()),
			Arc::clone(&http) as Arc<dyn ProtocolModule>,
			Arc::new(crate::modules::redis::RedisModule::default()),
			Arc::new(crate::modules::secure::SecureModule::disabled()),
		));

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (accepted, _connector) = tokio::join!(listener.accept(), TcpStream::connect(addr));
		let (_server_read_half, server_write_half) = accepted.unwrap().0.into_split();

		let client = Client::new(
			ClientHandle(0),
			StreamFamily::Tcp4,
			"127.0.0.1".to_string(),
			0,
			crate::client::WriteHalf::Tcp(server_write_half),
			Arc::clone(&modules),
			Weak::new(),
		);
		client.set_tag(PlaintextProtocol::Http);

		let proxy = Proxy::new_for_tests(modules);
		let submitter = proxy.write_submitter();

		submitter.submit(Arc::clone(&client), WriteRequest::single(b"hi".to_vec()));

		// a concurrent EOF on the read loop closes the client while our write
		// is still queued; the submitter's own reference keeps the refcount
		// above zero, so the close hook must not fire yet.
		client.close();
		assert_eq!(http.closes.load(Ordering::SeqCst), 0);

		let job = submitter
			.receiver
			.try_recv()
			.expect("the queued write should still be in the channel");
		dispatch_one(&proxy, job).await;

		// only once dispatch_one released its reference does the client's
		// refcount reach zero and the close hook fire.
		assert_eq!(http.closes.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn submit_after_refcount_reaches_zero_is_a_silent_no_op() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (accepted, _connector) = tokio::join!(listener.accept(), TcpStream::connect(addr));
		let (_server_read_half, server_write_half) = accepted.unwrap().0.into_split();

		let client = Client::new(
			ClientHandle(0),
			StreamFamily::Tcp4,
			"127.0.0.1".to_string(),
			0,
			crate::client::WriteHalf::Tcp(server_write_half),
			Arc::new(ModuleRegistry::new_noop()),
			Weak::new(),
		);

		// drop the one outstanding (accept-path) reference, taking the
		// refcount to zero.
		client.close();

		let proxy = Proxy::new_for_tests(Arc::new(ModuleRegistry::new_noop()));
		proxy
			.write_submitter()
			.submit(Arc::clone(&client), WriteRequest::single(b"late".to_vec()));

		assert!(proxy.write_submitter().receiver.try_recv().is_err());
	}
}
