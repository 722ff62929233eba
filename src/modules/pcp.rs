//! The PCP (Performance Co-Pilot) protocol module.
//!
//! PDU framing and request handling are out of scope for this crate; this
//! module demonstrates the [`ProtocolModule`] contract for clients classified
//! as `PCP`.

use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use async_trait::async_trait;
use tracing::trace;

use crate::{client::Client, module::ProtocolModule, proxy::Proxy};

/// A pass-through handler for `PCP`-classified clients.
#[derive(Debug, Default)]
pub struct PcpModule {
	reads: AtomicU64,
}

#[async_trait]
impl ProtocolModule for PcpModule {
	async fn setup(&self, _proxy: &Proxy) {
		trace!("pcp module ready");
	}

	async fn on_client_read(&self, _proxy: &Proxy, client: &Arc<Client>, buf: &[u8]) {
		self.reads.fetch_add(1, Ordering::Relaxed);
		trace!(handle = ?client.handle(), len = buf.len(), "pcp read");
	}

	fn on_client_close(&self, client: &Client) {
		trace!(handle = ?client.handle(), "pcp client closed");
	}

	async fn close(&self, _proxy: &Proxy) {
		trace!(reads = self.reads.load(Ordering::Relaxed), "pcp module shut down");
	}
}
