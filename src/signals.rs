//! The signal supervisor: graceful shutdown on `SIGINT`/`SIGTERM`, `SIGHUP`
//! observed but ignored, `SIGPIPE` ignored process-wide.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::proxy::Proxy;

/// Owns the `SIGINT`/`SIGTERM`/`SIGHUP` listener tasks for one [`Proxy`].
#[derive(Debug)]
pub struct SignalSupervisor;

impl SignalSupervisor {
	/// Spawn the supervisor task. `SIGPIPE` is ignored process-wide; writes
	/// to a closed socket already surface as an `Err` from `write_all`, and
	/// Rust's standard library disposes `SIGPIPE` to `SIG_IGN` at process
	/// startup, so there is nothing further to wire up here.
	pub(crate) fn spawn(proxy: Arc<Proxy>) {
		tokio::spawn(async move {
			let mut sigint = match signal(SignalKind::interrupt()) {
				Ok(stream) => stream,
				Err(err) => {
					tracing::error!(error = %err, "could not install SIGINT handler");
					return;
				}
			};
			let mut sigterm = match signal(SignalKind::terminate()) {
				Ok(stream) => stream,
				Err(err) => {
					tracing::error!(error = %err, "could not install SIGTERM handler");
					return;
				}
			};
			let mut sighup = match signal(SignalKind::hangup()) {
				Ok(stream) => stream,
				Err(err) => {
					tracing::error!(error = %err, "could not install SIGHUP handler");
					return;
				}
			};

			loop {
				tokio::select! {
					_ = sigint.recv() => {
						info!("received SIGINT, shutting down");
						proxy.shutdown().await;
						break;
					}
					_ = sigterm.recv() => {
						info!("received SIGTERM, shutting down");
						proxy.shutdown().await;
						break;
					}
					_ = sighup.recv() => {
						info!("received SIGHUP, ignoring (reserved for reload)");
					}
				}
			}
		});
	}
}
