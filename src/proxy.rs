//! The [`Proxy`] root: owns the live-client table, the server list, the
//! write submitter, and the startup/shutdown sequence.
//!
//! The "doubly-linked list of live Clients" from the data model is rendered
//! as a [`slab::Slab`] keyed by a generational [`ClientHandle`] newtype, the
//! same pattern `quinn-proto`'s `Endpoint` uses for its `Slab<Connection>` +
//! `ConnectionHandle`. Because this crate runs on a multi-thread Tokio
//! runtime rather than a single loop thread, the slab is guarded by a
//! `parking_lot::Mutex`: at most one task is ever the *logical* owner of a
//! given client's accept/destroy path at a time, but that task may run on
//! any worker thread, so the guard is needed for soundness even though the
//! original single-threaded-loop design did not require one.

use std::sync::Arc;

use slab::Slab;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::{
	client::Client,
	config::Config,
	endpoint::{resolve_endpoints, with_local_socket},
	error::StartupError,
	listener::Server,
	module::ModuleRegistry,
	signals::SignalSupervisor,
	write::{WriteRequest, WriteSubmitter},
};

/// A generational handle into the proxy's live-client table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub(crate) usize);

/// The process-wide proxy root.
pub struct Proxy {
	config: Config,
	clients: parking_lot::Mutex<Slab<Arc<Client>>>,
	servers: parking_lot::Mutex<Vec<Server>>,
	modules: Arc<ModuleRegistry>,
	write_submitter: WriteSubmitter,
	shutdown_complete: Notify,
}

impl Proxy {
	/// Resolve the configured endpoints, bind and listen on each, and start
	/// accepting connections. Fails only if not a single endpoint could be
	/// opened.
	pub async fn start(
		config: Config,
		modules: Arc<ModuleRegistry>,
	) -> Result<Arc<Self>, StartupError> {
		let write_submitter = WriteSubmitter::new();

		let proxy = Arc::new(Self {
			config,
			clients: parking_lot::Mutex::new(Slab::new()),
			servers: parking_lot::Mutex::new(Vec::new()),
			modules,
			write_submitter,
			shutdown_complete: Notify::new(),
		});

		let endpoints = with_local_socket(
			resolve_endpoints(proxy.config.endpoints(), proxy.config.ipv6()),
			proxy.config.local_socket(),
		);
		let mut servers = Vec::with_capacity(endpoints.len());
		let mut opened = 0usize;

		for endpoint in endpoints {
			match Server::bind(&endpoint, &proxy).await {
				Ok(server) => {
					opened += 1;
					servers.push(server);
				}
				Err(err) => {
					warn!(%endpoint, error = %err, "could not open request port, skipping");
					servers.push(Server::failed(endpoint));
				}
			}
		}

		if opened == 0 {
			return Err(StartupError::NoListeningEndpoints);
		}

		*proxy.servers.lock() = servers;

		proxy.write_submitter.spawn_dispatcher(Arc::clone(&proxy));

		// run every module's setup hook once the loop is live, yielding first
		// so the accept tasks above are already registered.
		{
			let proxy = Arc::clone(&proxy);
			tokio::spawn(async move {
				tokio::task::yield_now().await;
				proxy.modules.setup_all(&proxy).await;
			});
		}

		SignalSupervisor::spawn(Arc::clone(&proxy));

		info!(endpoints = opened, "pmproxy core started");

		Ok(proxy)
	}

	/// This proxy's configuration.
	#[must_use]
	pub const fn config(&self) -> &Config {
		&self.config
	}

	/// The registry of protocol modules this proxy dispatches to.
	#[must_use]
	pub fn modules(&self) -> &Arc<ModuleRegistry> {
		&self.modules
	}

	/// A handle usable to submit writes to clients from any thread.
	#[must_use]
	pub fn write_submitter(&self) -> &WriteSubmitter {
		&self.write_submitter
	}

	/// Register a newly-accepted client in the live-client table. `build` is
	/// handed the [`ClientHandle`] the slab has reserved for it, and must
	/// return the constructed [`Client`] to store there; this lets `Client`
	/// carry its own handle without a two-phase placeholder-then-patch dance.
	/// Called by the listener immediately after accept, before reads start.
	pub(crate) fn register_client(
		&self,
		build: impl FnOnce(ClientHandle) -> Arc<Client>,
	) -> Arc<Client> {
		let mut clients = self.clients.lock();
		let key = clients.vacant_key();
		let client = build(ClientHandle(key));
		let inserted = clients.insert(Arc::clone(&client));
		debug_assert_eq!(inserted, key, "vacant_key must match the fresh insert");
		client
	}

	/// Number of clients currently in the live-client table.
	#[must_use]
	pub fn client_count(&self) -> usize {
		self.clients.lock().len()
	}

	/// Unlink a client from the live-client table. Called exactly once, by
	/// [`Client::put`](crate::client::Client::put) at the refcount-zero
	/// transition.
	pub(crate) fn unlink_client(&self, handle: ClientHandle) {
		let mut clients = self.clients.lock();
		if clients.contains(handle.0) {
			clients.remove(handle.0);
		}
	}

	/// Submit a write. See [`WriteSubmitter::submit`].
	pub fn client_write(&self, client: &Arc<Client>, request: WriteRequest) {
		self.write_submitter.submit(Arc::clone(client), request);
	}

	/// A snapshot of the endpoints this proxy attempted to open, each paired
	/// with whether it is currently active.
	#[must_use]
	pub fn dump(&self) -> Vec<crate::listener::ServerStatus> {
		self.servers.lock().iter().map(Server::status).collect()
	}

	/// Construct a bare `Proxy` with no servers and a default configuration,
	/// for unit tests that only exercise module dispatch and need something
	/// to call `proxy.modules()` on.
	#[cfg(test)]
	pub(crate) fn new_for_tests(modules: Arc<ModuleRegistry>) -> Arc<Self> {
		Arc::new(Self {
			config: Config::default(),
			clients: parking_lot::Mutex::new(Slab::new()),
			servers: parking_lot::Mutex::new(Vec::new()),
			modules,
			write_submitter: WriteSubmitter::new(),
			shutdown_complete: Notify::new(),
		})
	}

	/// Shut down every server and every protocol module. Servers are
	/// iterated exactly once each (see DESIGN.md for why a double-advance
	/// loop that skips every other server was rejected here).
	pub async fn shutdown(self: &Arc<Self>) {
		let servers = std::mem::take(&mut *self.servers.lock());
		for server in servers {
			server.shutdown().await;
		}

		self.modules.close_all(self).await;
		self.shutdown_complete.notify_one();
	}

	/// Block until [`shutdown`](Self::shutdown) has run to completion.
	/// Intended for the server binary's `main`, which otherwise has no way
	/// to know when the signal supervisor's own shutdown has finished.
	///
	/// Uses [`Notify::notify_one`]/[`Notify::notified`] rather than
	/// `notify_waiters`: the latter only wakes tasks already waiting at the
	/// moment it's called and stores no permit, so a `shutdown` that
	/// completes before `main` reaches this call would be missed and hang
	/// forever. `notify_one` stores a single wake-up permit if nothing is
	/// waiting yet, which is exactly the single-consumer case here.
	pub async fn wait_for_shutdown(self: &Arc<Self>) {
		self.shutdown_complete.notified().await;
	}
}
