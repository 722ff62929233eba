//! The Listener: binds and listens on each resolved [`Endpoint`], accepting
//! connections into freshly-registered [`Client`]s.

use std::{io, sync::Arc, time::Duration};

use socket2::{Domain, Protocol as SocketProtocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use crate::{
	client::{Client, StreamFamily, WriteHalf},
	demux::{run_read_loop, ReadHalf},
	endpoint::Endpoint,
	error::ListenError,
	proxy::Proxy,
};

/// A snapshot of one [`Server`]'s status, the Rust rendering of
/// `dump_request_ports`'s per-endpoint row.
#[derive(Debug, Clone)]
pub struct ServerStatus {
	/// Whether this endpoint is currently listening.
	pub ok: bool,
	/// The endpoint this status describes.
	pub endpoint: String,
	/// The port, or 0 for local endpoints.
	pub port: u16,
	/// The stream family.
	pub family: StreamFamily,
}

/// One listening endpoint, owned exclusively by the [`Proxy`]. Dropping the
/// accept task's `JoinHandle` aborts it; `shutdown` does so explicitly and
/// awaits the task, rather than blocking synchronously inside `Drop` (see
/// DESIGN.md for why synchronous teardown in `Drop` was rejected here).
pub struct Server {
	endpoint: Endpoint,
	family: StreamFamily,
	port: u16,
	accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl Server {
	/// Bind and start accepting on `endpoint`, registering each accepted
	/// connection with `proxy`.
	pub(crate) async fn bind(endpoint: &Endpoint, proxy: &Arc<Proxy>) -> Result<Self, ListenError> {
		match endpoint {
			Endpoint::Tcp(addr) => Self::bind_tcp(*addr, proxy).await,
			Endpoint::Local(path) => Self::bind_local(path, proxy).await,
		}
	}

	/// Construct a `Server` entry representing an endpoint that failed to
	/// open, so that it still shows up (as `err`) in [`Proxy::dump`].
	#[must_use]
	pub(crate) fn failed(endpoint: Endpoint) -> Self {
		let (family, port) = match &endpoint {
			Endpoint::Tcp(addr) if addr.is_ipv4() => (StreamFamily::Tcp4, addr.port()),
			Endpoint::Tcp(addr) => (StreamFamily::Tcp6, addr.port()),
			Endpoint::Local(_) => (StreamFamily::Local, 0),
		};

		Self {
			endpoint,
			family,
			port,
			accept_task: None,
		}
	}

	async fn bind_tcp(addr: std::net::SocketAddr, proxy: &Arc<Proxy>) -> Result<Self, ListenError> {
		let family = if addr.is_ipv4() {
			StreamFamily::Tcp4
		} else {
			StreamFamily::Tcp6
		};

		let to_listen_error = |source: io::Error| ListenError::Socket {
			address: addr.to_string(),
			source,
		};

		let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SocketProtocol::TCP))
			.map_err(to_listen_error)?;

		// `SO_REUSEADDR` only makes sense (and is only set) on Unix, and an
		// IPv6 socket is always bound v6-only here so that the IPv4 companion
		// endpoint binds separately.
		socket.set_reuse_address(cfg!(unix)).map_err(to_listen_error)?;
		if addr.is_ipv6() {
			socket.set_only_v6(true).map_err(to_listen_error)?;
		}
		socket.set_nonblocking(true).map_err(to_listen_error)?;
		socket.set_nodelay(true).map_err(to_listen_error)?;

		if let Some(keepalive_secs) = proxy.config().keepalive() {
			let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(keepalive_secs));
			socket.set_tcp_keepalive(&keepalive).map_err(to_listen_error)?;
		}

		socket.bind(&addr.into()).map_err(to_listen_error)?;
		socket
			.listen(proxy.config().maxpending() as i32)
			.map_err(to_listen_error)?;

		let listener = TcpListener::from_std(socket.into()).map_err(to_listen_error)?;

		// the actually-bound port, which may differ from `addr.port()` when
		// the caller requested port 0 (OS-assigned ephemeral port)
		let bound_port = listener.local_addr().map_err(to_listen_error)?.port();

		debug!(%addr, bound_port, "opened TCP listener");

		let accept_task = {
			let proxy = Arc::clone(proxy);
			tokio::spawn(async move {
				loop {
					match listener.accept().await {
						Ok((stream, remote_addr)) => {
							accept_tcp(&proxy, stream, remote_addr, family).await;
						}
						Err(err) => {
							warn!(%addr, error = %err, "error accepting TCP connection");
						}
					}
				}
			})
		};

		Ok(Self {
			endpoint: Endpoint::Tcp(addr),
			family,
			port: bound_port,
			accept_task: Some(accept_task),
		})
	}

	async fn bind_local(path: &std::path::Path, proxy: &Arc<Proxy>) -> Result<Self, ListenError> {
		use std::os::unix::fs::PermissionsExt;

		let to_listen_error = |source: io::Error| ListenError::Socket {
			address: path.display().to_string(),
			source,
		};

		// a stale socket file from a previous run must not prevent bind
		let _ = std::fs::remove_file(path);

		let listener = UnixListener::bind(path).map_err(to_listen_error)?;

		// world-readable, matching libuv's `uv_pipe_chmod(UV_READABLE)`
		std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
			.map_err(to_listen_error)?;

		debug!(path = %path.display(), "opened local listener");

		let accept_task = {
			let proxy = Arc::clone(proxy);
			let path_for_log = path.to_path_buf();
			tokio::spawn(async move {
				loop {
					match listener.accept().await {
						Ok((stream, _addr)) => {
							accept_local(&proxy, stream, &path_for_log).await;
						}
						Err(err) => {
							warn!(path = %path_for_log.display(), error = %err, "error accepting local connection");
						}
					}
				}
			})
		};

		Ok(Self {
			endpoint: Endpoint::Local(path.to_path_buf()),
			family: StreamFamily::Local,
			port: 0,
			accept_task: Some(accept_task),
		})
	}

	/// A snapshot of this server's status, for [`Proxy::dump`].
	#[must_use]
	pub(crate) fn status(&self) -> ServerStatus {
		ServerStatus {
			ok: self.accept_task.is_some(),
			endpoint: self.endpoint.to_string(),
			port: self.port,
			family: self.family,
		}
	}

	/// Stop accepting new connections on this endpoint.
	pub(crate) async fn shutdown(self) {
		if let Some(task) = self.accept_task {
			task.abort();
			let _ = task.await;
			info!(endpoint = %self.endpoint, "closed listener");
		}
	}
}

async fn accept_tcp(
	proxy: &Arc<Proxy>,
	stream: tokio::net::TcpStream,
	remote_addr: std::net::SocketAddr,
	family: StreamFamily,
) {
	let (read_half, write_half) = stream.into_split();
	let address = remote_addr.ip().to_string();
	let port = remote_addr.port();

	let client = proxy.register_client(|handle| {
		Client::new(
			handle,
			family,
			address,
			port,
			WriteHalf::Tcp(write_half),
			Arc::clone(proxy.modules()),
			Arc::downgrade(proxy),
		)
	});

	tokio::spawn(run_read_loop(
		Arc::clone(proxy),
		client,
		ReadHalf::Tcp(read_half),
	));
}

async fn accept_local(proxy: &Arc<Proxy>, stream: tokio::net::UnixStream, path: &std::path::Path) {
	let (read_half, write_half) = stream.into_split();
	let address = path.display().to_string();

	let client = proxy.register_client(|handle| {
		Client::new(
			handle,
			StreamFamily::Local,
			address,
			0,
			WriteHalf::Local(write_half),
			Arc::clone(proxy.modules()),
			Arc::downgrade(proxy),
		)
	});

	tokio::spawn(run_read_loop(
		Arc::clone(proxy),
		client,
		ReadHalf::Local(read_half),
	));
}
