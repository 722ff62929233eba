//! The per-connection [`Client`] state machine: reference counting, the
//! protocol mask, and the idempotent close protocol.
//!
//! The reference count here is a *logical* count of outstanding asynchronous
//! references (read loop, in-flight writes, stashed pointers), distinct from
//! `Arc`'s own strong count. `Arc<Client>` gives us safe, cheap cloning and
//! memory reclamation; `get`/`put` on top of it enforce an exactly-once-
//! destruction contract, including a close-hook fan-out that must run
//! precisely once, at the logical zero transition.

use std::{
	fmt,
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::{
	net::{unix::OwnedWriteHalf as UnixOwnedWriteHalf, tcp::OwnedWriteHalf as TcpOwnedWriteHalf},
	sync::Mutex as AsyncMutex,
};
use tokio_rustls::rustls::ServerConnection;
use tracing::{debug, trace};

use crate::{classify::PlaintextProtocol, module::ModuleRegistry, proxy::ClientHandle};

/// The address family of a [`Client`]'s underlying stream, mirroring the
/// tagged `Stream` union of the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamFamily {
	/// IPv4 TCP.
	Tcp4,
	/// IPv6 TCP, bound v6-only.
	Tcp6,
	/// A local (Unix domain socket) filesystem endpoint.
	Local,
}

/// The write half of a client's underlying transport, split off at accept
/// time so that the write submitter can use it independently of the read
/// loop. See [`crate::listener`] for where these are produced.
pub enum WriteHalf {
	/// A TCP connection's write half.
	Tcp(TcpOwnedWriteHalf),
	/// A local socket connection's write half.
	Local(UnixOwnedWriteHalf),
}

impl WriteHalf {
	pub(crate) async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
		use tokio::io::AsyncWriteExt;

		match self {
			Self::Tcp(half) => half.write_all(buf).await,
			Self::Local(half) => half.write_all(buf).await,
		}
	}
}

/// The set of protocol tags attached to a [`Client`].
///
/// At most one of [`PlaintextProtocol`] is ever latched (and once set, it is
/// never cleared or replaced); `secure` may additionally be set to indicate
/// that inbound/outbound bytes pass through the TLS wrap/unwrap layer before
/// this tag applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolMask {
	tag: Option<PlaintextProtocol>,
	secure: bool,
}

impl ProtocolMask {
	/// The plaintext protocol latched onto this mask, if any.
	#[must_use]
	pub const fn tag(self) -> Option<PlaintextProtocol> {
		self.tag
	}

	/// Whether the `SECURE` (TLS) bit is set.
	#[must_use]
	pub const fn is_secure(self) -> bool {
		self.secure
	}

	/// Whether no plaintext protocol has been latched yet.
	#[must_use]
	pub const fn is_unknown(self) -> bool {
		self.tag.is_none()
	}

	fn set_secure(&mut self) {
		self.secure = true;
	}

	/// Latch a plaintext protocol tag. Does nothing if a tag is already set;
	/// once set, a tag is never cleared or replaced.
	fn set_tag(&mut self, tag: PlaintextProtocol) {
		if self.tag.is_none() {
			self.tag = Some(tag);
		}
	}
}

#[derive(Debug)]
struct ClientState {
	refcount: usize,
	opened: bool,
	mask: ProtocolMask,
}

/// One accepted connection and its state: the write half of its transport,
/// protocol mask, and logical reference count.
pub struct Client {
	handle: ClientHandle,
	family: StreamFamily,
	address: String,
	port: u16,
	write_half: AsyncMutex<WriteHalf>,
	state: Mutex<ClientState>,
	/// The TLS session context, populated by the secure module on its first
	/// `unwrap`/`wrap` call for this client and otherwise left `None`. Only
	/// the secure module touches this field.
	tls_session: Mutex<Option<ServerConnection>>,
	modules: Arc<ModuleRegistry>,
	proxy: Weak<crate::proxy::Proxy>,
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("handle", &self.handle)
			.field("family", &self.family)
			.field("address", &self.address)
			.field("port", &self.port)
			.field("state", &self.state)
			.finish_non_exhaustive()
	}
}

impl Client {
	/// Construct a new, opened `Client` with refcount 1 and an empty
	/// protocol mask. Called exactly once, by the listener, on accept.
	pub(crate) fn new(
		handle: ClientHandle,
		family: StreamFamily,
		address: String,
		port: u16,
		write_half: WriteHalf,
		modules: Arc<ModuleRegistry>,
		proxy: Weak<crate::proxy::Proxy>,
	) -> Arc<Self> {
		Arc::new(Self {
			handle,
			family,
			address,
			port,
			write_half: AsyncMutex::new(write_half),
			state: Mutex::new(ClientState {
				refcount: 1,
				opened: true,
				mask: ProtocolMask::default(),
			}),
			tls_session: Mutex::new(None),
			modules,
			proxy,
		})
	}

	/// This client's handle into the proxy's live-client table.
	#[must_use]
	pub const fn handle(&self) -> ClientHandle {
		self.handle
	}

	/// The address family of this client's underlying stream.
	#[must_use]
	pub const fn family(&self) -> StreamFamily {
		self.family
	}

	/// The remote address this client connected from (or the local socket
	/// path, for [`StreamFamily::Local`] clients).
	#[must_use]
	pub fn address(&self) -> &str {
		&self.address
	}

	/// The local port this client connected to (0 for [`StreamFamily::Local`]).
	#[must_use]
	pub const fn port(&self) -> u16 {
		self.port
	}

	/// The current protocol mask.
	#[must_use]
	pub fn mask(&self) -> ProtocolMask {
		self.state.lock().mask
	}

	/// Whether the client is still open (i.e. `close` has not yet been
	/// called, or has not yet completed).
	#[must_use]
	pub fn is_open(&self) -> bool {
		self.state.lock().opened
	}

	/// Latch the `SECURE` bit onto this client's protocol mask.
	pub(crate) fn set_secure(&self) {
		self.state.lock().mask.set_secure();
	}

	/// Latch a plaintext protocol tag onto this client's protocol mask. A
	/// no-op if a tag is already latched.
	pub(crate) fn set_tag(&self, tag: PlaintextProtocol) {
		self.state.lock().mask.set_tag(tag);
	}

	/// Run `f` against this client's TLS session slot, initializing it with
	/// `init` on first access. Used exclusively by the secure module.
	pub(crate) fn with_tls_session<R>(
		&self,
		init: impl FnOnce() -> ServerConnection,
		f: impl FnOnce(&mut ServerConnection) -> R,
	) -> R {
		let mut slot = self.tls_session.lock();
		let session = slot.get_or_insert_with(init);
		f(session)
	}

	/// Run `f` against this client's TLS session slot only if it has already
	/// been initialized; a no-op `None` otherwise. Used by the secure
	/// module's pre-/post-I/O flush, which must tolerate running before any
	/// handshake bytes have been seen.
	pub(crate) fn try_with_tls_session<R>(&self, f: impl FnOnce(&mut ServerConnection) -> R) -> Option<R> {
		let mut slot = self.tls_session.lock();
		slot.as_mut().map(f)
	}

	/// Increment the logical reference count. Used by any component that
	/// stashes a reference to this client across an asynchronous boundary.
	///
	/// # Panics
	/// Panics if called after the refcount has already reached zero (i.e. on
	/// an already-destroyed client), which would indicate a missing `get`
	/// somewhere upstream.
	pub fn get(self: &Arc<Self>) -> Arc<Self> {
		let mut state = self.state.lock();
		assert!(state.refcount > 0, "get() on a client with refcount 0");
		state.refcount += 1;
		drop(state);
		Arc::clone(self)
	}

	/// Like [`get`](Self::get), but returns `None` instead of panicking if
	/// the refcount has already reached zero. For callers on a thread that
	/// cannot otherwise synchronize with a concurrent destroying `put` (the
	/// write submitter stashing a client it only observed via a channel
	/// send), where the alternative to a graceful no-op is a crash.
	#[must_use]
	pub fn try_get(self: &Arc<Self>) -> Option<Arc<Self>> {
		let mut state = self.state.lock();
		if state.refcount == 0 {
			return None;
		}
		state.refcount += 1;
		drop(state);
		Some(Arc::clone(self))
	}

	/// Decrement the logical reference count. If it reaches zero, performs
	/// destruction: fans out a `close` notification to every protocol module
	/// whose bit is set in the mask, then drops this `Arc` (the slab entry
	/// was already unlinked by [`close`](Self::close) or by the proxy's
	/// accept-path error handling).
	pub fn put(self: Arc<Self>) {
		let refcount = {
			let mut state = self.state.lock();
			assert!(state.refcount > 0, "put() on a client with refcount 0");
			state.refcount -= 1;
			state.refcount
		};

		if refcount == 0 {
			let mask = self.mask();
			trace!(handle = ?self.handle, ?mask, "destroying client");

			if let Some(proxy) = self.proxy.upgrade() {
				proxy.unlink_client(self.handle);
			}

			if let Some(tag) = mask.tag() {
				self.modules.plaintext_for(tag).on_client_close(&*self);
			}
			if mask.is_secure() {
				self.modules.secure().on_client_close(&*self);
			}
		}
	}

	/// Idempotently close this client. If it is currently open, flips
	/// `opened` to `false`; a second call is a no-op (refcount unchanged, no
	/// re-entry of protocol close hooks).
	///
	/// Closing does not itself destroy the client (see [`put`](Self::put));
	/// it releases the logical reference that the accept path held for the
	/// lifetime of the connection, so destruction happens once every other
	/// in-flight `get` has been matched by a `put`.
	pub fn close(self: &Arc<Self>) {
		let should_release = {
			let mut state = self.state.lock();
			if state.opened {
				state.opened = false;
				true
			} else {
				false
			}
		};

		if should_release {
			debug!(handle = ?self.handle, "closing client");
			Arc::clone(self).put();
		}
	}

	/// Write one (or, with `suffix`, two) buffers to this client's
	/// transport, in submission order. Returns an error if the underlying
	/// write fails; the caller (the write submitter) is responsible for
	/// closing the client on error.
	pub(crate) async fn write_buffers(
		&self,
		primary: &[u8],
		suffix: Option<&[u8]>,
	) -> std::io::Result<()> {
		let mut half = self.write_half.lock().await;
		half.write_all(primary).await?;
		if let Some(suffix) = suffix {
			half.write_all(suffix).await?;
		}
		Ok(())
	}
}
