//! End-to-end tests driving the real accept path: bind an ephemeral port via
//! [`Proxy::start`], connect a plain TCP client, and observe classification
//! and close behavior from outside the crate.

use std::{
	io::Write as _,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use clap::Parser as _;
use pmproxy_core::{
	client::Client,
	config::{Cli, Config},
	module::{ModuleRegistry, ProtocolModule},
	modules::{pcp::PcpModule, redis::RedisModule, secure::SecureModule},
	proxy::Proxy,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};

#[derive(Debug, Default)]
struct CountingHttpModule {
	reads: AtomicU64,
}

#[async_trait]
impl ProtocolModule for CountingHttpModule {
	async fn setup(&self, _proxy: &Proxy) {}

	async fn on_client_read(&self, _proxy: &Proxy, _client: &Arc<Client>, _buf: &[u8]) {
		self.reads.fetch_add(1, Ordering::SeqCst);
	}

	fn on_client_close(&self, _client: &Client) {}

	async fn close(&self, _proxy: &Proxy) {}
}

/// Write a minimal single-endpoint TOML config (port 0, so the OS assigns an
/// ephemeral port) to a fresh temp file and return its path. Each call uses a
/// distinct file name so concurrently-running tests don't clobber each
/// other's config.
fn write_temp_config() -> std::path::PathBuf {
	static COUNTER: AtomicU64 = AtomicU64::new(0);
	let n = COUNTER.fetch_add(1, Ordering::Relaxed);

	let path = std::env::temp_dir().join(format!(
		"pmproxy-core-test-{}-{n}.toml",
		std::process::id()
	));

	let mut file = std::fs::File::create(&path).expect("create temp config file");
	writeln!(
		file,
		r#"[pmproxy]
ipv6 = false
maxpending = 16

[[pmproxy.endpoints]]
address = "127.0.0.1"
port = 0
"#
	)
	.expect("write temp config file");

	path
}

async fn start_test_proxy(http: Arc<CountingHttpModule>) -> (Arc<Proxy>, u16, std::path::PathBuf) {
	let config_path = write_temp_config();
	let cli = Cli::parse_from([
		"pmproxyd",
		"--config",
		config_path.to_str().expect("temp path is valid UTF-8"),
	]);
	let config = Config::load(&cli);

	let modules = Arc::new(ModuleRegistry::new(
		Arc::new(PcpModule::default()),
		http,
		Arc::new(RedisModule::default()),
		Arc::new(SecureModule::disabled()),
	));

	let proxy = Proxy::start(config, modules)
		.await
		.expect("proxy should start with one bindable endpoint");

	let statuses = proxy.dump();
	assert_eq!(statuses.len(), 1, "expected exactly one configured endpoint");
	assert!(statuses[0].ok, "the single endpoint should be listening");
	let port = statuses[0].port;
	assert_ne!(port, 0, "bound port should reflect the OS-assigned ephemeral port");

	(proxy, port, config_path)
}

#[tokio::test]
async fn http_get_is_classified_and_dispatched() {
	let http = Arc::new(CountingHttpModule::default());
	let (proxy, port, config_path) = start_test_proxy(Arc::clone(&http)).await;

	let mut stream = TcpStream::connect(("127.0.0.1", port))
		.await
		.expect("connect to test proxy");
	stream
		.write_all(b"GET / HTTP/1.1\r\n\r\n")
		.await
		.expect("write HTTP request");

	// give the accept + read loop a chance to run
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(http.reads.load(Ordering::SeqCst), 1, "http module should see exactly one read");
	assert_eq!(proxy.client_count(), 1, "the connection should still be live and tracked");

	proxy.shutdown().await;
	let _ = std::fs::remove_file(config_path);
}

#[tokio::test]
async fn unknown_first_byte_closes_the_connection() {
	let http = Arc::new(CountingHttpModule::default());
	let (proxy, port, config_path) = start_test_proxy(Arc::clone(&http)).await;

	let mut stream = TcpStream::connect(("127.0.0.1", port))
		.await
		.expect("connect to test proxy");
	stream
		.write_all(&[0x00])
		.await
		.expect("write unrecognized byte");

	let mut buf = [0u8; 8];
	let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
		.await
		.expect("server should close promptly rather than hang")
		.expect("read should not error");

	assert_eq!(read, 0, "server should close the connection (EOF) on an unrecognized byte");
	assert_eq!(http.reads.load(Ordering::SeqCst), 0, "http module must not see an unrecognized byte");

	proxy.shutdown().await;
	let _ = std::fs::remove_file(config_path);
}
