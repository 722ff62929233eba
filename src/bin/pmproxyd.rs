//! `pmproxyd`: the proxy accept/demux core's server binary.
//!
//! Loads configuration from built-in defaults, an optional TOML file, and
//! command-line flags, wires up the fixed set of protocol modules, and runs
//! the proxy loop until `SIGINT`/`SIGTERM`. `--dump` attempts the configured
//! endpoints, prints the resulting ok/err table, then shuts down immediately
//! without accepting any connections.

use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use pmproxy_core::{
	certs::{get_certkey, CertWatcher, CertificateResolver},
	config::{Cli, Config},
	module::ModuleRegistry,
	modules::{http::HttpModule, pcp::PcpModule, redis::RedisModule, secure::SecureModule},
	proxy::Proxy,
};
use tokio_rustls::rustls::ServerConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str) {
	let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build the secure module from `config`'s TLS cert/key paths, if configured.
/// A missing or unloadable cert/key pair falls back to a disabled module:
/// `SECURE` can still be classified, but no handshake ever completes.
fn build_secure_module(config: &Config) -> Arc<SecureModule> {
	let Some((cert_path, key_path)) = config.tls_paths() else {
		return Arc::new(SecureModule::disabled());
	};

	let certkey = match get_certkey(cert_path, key_path) {
		Ok(certkey) => certkey,
		Err(err) => {
			error!(%err, "could not load TLS certificate/key, starting with TLS disabled");
			return Arc::new(SecureModule::disabled());
		}
	};

	let resolver = Arc::new(CertificateResolver::new(Some(Arc::new(certkey))));

	if let Err(err) = CertWatcher::spawn(cert_path.clone(), key_path.clone(), Arc::clone(&resolver)) {
		error!(%err, "could not install TLS certificate file watcher, hot-reload disabled");
	}

	let mut server_config = ServerConfig::builder()
		.with_no_client_auth()
		.with_cert_resolver(resolver);
	server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

	Arc::new(SecureModule::new(Arc::new(server_config)))
}

fn print_dump(proxy: &Proxy) {
	for status in proxy.dump() {
		println!(
			"{:<4} {:<8?} {:<6} {}",
			if status.ok { "ok" } else { "err" },
			status.family,
			status.port,
			status.endpoint
		);
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	init_tracing(&cli.log_level);

	let config = Config::load(&cli);
	let secure = build_secure_module(&config);
	let modules = Arc::new(ModuleRegistry::new(
		Arc::new(PcpModule::default()),
		Arc::new(HttpModule::default()),
		Arc::new(RedisModule::default()),
		secure,
	));

	let proxy = match Proxy::start(config, modules)
		.await
		.context("no request ports could be opened")
	{
		Ok(proxy) => proxy,
		Err(err) => {
			error!(%err, "failed to start pmproxy core");
			return ExitCode::FAILURE;
		}
	};

	if cli.dump {
		print_dump(&proxy);
		proxy.shutdown().await;
		return ExitCode::SUCCESS;
	}

	proxy.wait_for_shutdown().await;
	ExitCode::SUCCESS
}
