//! The RESP (Redis serialization protocol) module.
//!
//! Command decoding is out of scope for this crate; this module demonstrates
//! the [`ProtocolModule`] contract for clients classified as `REDIS`.

use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use async_trait::async_trait;
use tracing::trace;

use crate::{client::Client, module::ProtocolModule, proxy::Proxy};

/// A pass-through handler for `REDIS`-classified clients.
#[derive(Debug, Default)]
pub struct RedisModule {
	reads: AtomicU64,
}

#[async_trait]
impl ProtocolModule for RedisModule {
	async fn setup(&self, _proxy: &Proxy) {
		trace!("redis module ready");
	}

	async fn on_client_read(&self, _proxy: &Proxy, client: &Arc<Client>, buf: &[u8]) {
		self.reads.fetch_add(1, Ordering::Relaxed);
		trace!(handle = ?client.handle(), len = buf.len(), "redis read");
	}

	fn on_client_close(&self, client: &Client) {
		trace!(handle = ?client.handle(), "redis client closed");
	}

	async fn close(&self, _proxy: &Proxy) {
		trace!(reads = self.reads.load(Ordering::Relaxed), "redis module shut down");
	}
}
