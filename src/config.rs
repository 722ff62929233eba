//! Configuration for the proxy core.
//!
//! Options are layered from (lowest to highest precedence) built-in defaults,
//! an optional TOML file under the `[pmproxy]` table, and command-line flags
//! (with environment variable fallback via `clap`'s `env` feature). CLI flags
//! are given the final say since this crate has no RPC-settable configuration
//! surface to justify precedence above the file.

use std::{fs, net::IpAddr, path::PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

/// Default TCP keepalive interval, in seconds.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 45;
/// Default listen backlog.
pub const DEFAULT_MAXPENDING: u32 = 128;

/// One requested endpoint: an address (or a sentinel) and a port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointSpec {
	/// The requested address, or `None`/`"INADDR_ANY"`/`"INADDR_LOOPBACK"`.
	pub address: Option<String>,
	/// The port to bind.
	pub port: u16,
}

/// Command-line flags, parsed with `clap`'s derive API. Each flag falls back
/// to an environment variable of the same name, prefixed `PMPROXY_`.
#[derive(Debug, Parser)]
#[command(name = "pmproxyd", about = "Multi-protocol proxy accept/demux core")]
pub struct Cli {
	/// Path to a TOML configuration file.
	#[arg(long, env = "PMPROXY_CONFIG")]
	pub config: Option<PathBuf>,

	/// TCP keepalive interval in seconds (0 disables).
	#[arg(long, env = "PMPROXY_KEEPALIVE")]
	pub keepalive: Option<u64>,

	/// Listen backlog size.
	#[arg(long, env = "PMPROXY_MAXPENDING")]
	pub maxpending: Option<u32>,

	/// Enable IPv6 endpoint expansion and binding.
	#[arg(long, env = "PMPROXY_IPV6")]
	pub ipv6: Option<bool>,

	/// Path to a local (Unix domain socket) endpoint.
	#[arg(long, env = "PMPROXY_LOCAL_SOCKET")]
	pub local_socket: Option<PathBuf>,

	/// Path to a PEM-encoded TLS certificate chain.
	#[arg(long, env = "PMPROXY_TLS_CERT")]
	pub tls_cert: Option<PathBuf>,

	/// Path to a PEM-encoded TLS private key.
	#[arg(long, env = "PMPROXY_TLS_KEY")]
	pub tls_key: Option<PathBuf>,

	/// Print the resolved endpoint set (ok/err, descriptor, port, family,
	/// address) and exit, without starting the proxy loop.
	#[arg(long)]
	pub dump: bool,

	/// Log level (`error`, `warn`, `info`, `debug`, `trace`).
	#[arg(long, env = "PMPROXY_LOG_LEVEL", default_value = "info")]
	pub log_level: String,
}

/// The `[pmproxy]` table of an on-disk TOML configuration file. Every field is
/// optional; absent fields fall through to the built-in default.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
	pmproxy: PmproxyTable,
}

#[derive(Debug, Default, Deserialize)]
struct PmproxyTable {
	keepalive: Option<u64>,
	maxpending: Option<u32>,
	ipv6: Option<bool>,
	local_socket: Option<PathBuf>,
	tls_cert: Option<PathBuf>,
	tls_key: Option<PathBuf>,
	endpoints: Option<Vec<EndpointSpec>>,
}

/// The fully-resolved configuration used for the lifetime of one proxy.
#[derive(Debug, Clone)]
pub struct Config {
	keepalive_secs: u64,
	maxpending: u32,
	ipv6: bool,
	local_socket: Option<PathBuf>,
	tls_cert: Option<PathBuf>,
	tls_key: Option<PathBuf>,
	endpoints: Vec<EndpointSpec>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			keepalive_secs: DEFAULT_KEEPALIVE_SECS,
			maxpending: DEFAULT_MAXPENDING,
			ipv6: true,
			local_socket: None,
			tls_cert: None,
			tls_key: None,
			endpoints: vec![EndpointSpec {
				address: None,
				port: 44321,
			}],
		}
	}
}

impl Config {
	/// Build a `Config` from defaults, an optional config file, and parsed CLI
	/// flags, in that precedence order. A missing or unreadable config file is
	/// logged and otherwise ignored rather than treated as fatal.
	#[must_use]
	pub fn load(cli: &Cli) -> Self {
		let mut config = Self::default();

		if let Some(path) = &cli.config {
			match fs::read_to_string(path) {
				Ok(contents) => match basic_toml::from_str::<FileConfig>(&contents) {
					Ok(file) => config.apply_file(file.pmproxy),
					Err(err) => warn!(%err, path = %path.display(), "could not parse configuration file"),
				},
				Err(err) => warn!(%err, path = %path.display(), "could not read configuration file"),
			}
		}

		config.apply_cli(cli);
		config
	}

	fn apply_file(&mut self, file: PmproxyTable) {
		if let Some(keepalive) = file.keepalive {
			self.keepalive_secs = keepalive;
		}
		if let Some(maxpending) = file.maxpending {
			self.maxpending = maxpending;
		}
		if let Some(ipv6) = file.ipv6 {
			self.ipv6 = ipv6;
		}
		if file.local_socket.is_some() {
			self.local_socket = file.local_socket;
		}
		if file.tls_cert.is_some() {
			self.tls_cert = file.tls_cert;
		}
		if file.tls_key.is_some() {
			self.tls_key = file.tls_key;
		}
		if let Some(endpoints) = file.endpoints {
			self.endpoints = endpoints;
		}
	}

	fn apply_cli(&mut self, cli: &Cli) {
		if let Some(keepalive) = cli.keepalive {
			self.keepalive_secs = keepalive;
		}
		if let Some(maxpending) = cli.maxpending {
			self.maxpending = maxpending;
		}
		if let Some(ipv6) = cli.ipv6 {
			self.ipv6 = ipv6;
		}
		if cli.local_socket.is_some() {
			self.local_socket.clone_from(&cli.local_socket);
		}
		if cli.tls_cert.is_some() {
			self.tls_cert.clone_from(&cli.tls_cert);
		}
		if cli.tls_key.is_some() {
			self.tls_key.clone_from(&cli.tls_key);
		}
	}

	/// TCP keepalive interval; `None` if disabled (configured as `0`).
	#[must_use]
	pub const fn keepalive(&self) -> Option<u64> {
		if self.keepalive_secs == 0 {
			None
		} else {
			Some(self.keepalive_secs)
		}
	}

	/// The configured listen backlog.
	#[must_use]
	pub const fn maxpending(&self) -> u32 {
		self.maxpending
	}

	/// Whether IPv6 endpoint expansion and binding is enabled.
	#[must_use]
	pub const fn ipv6(&self) -> bool {
		self.ipv6
	}

	/// The configured local (Unix domain socket) endpoint path, if any.
	#[must_use]
	pub fn local_socket(&self) -> Option<&PathBuf> {
		self.local_socket.as_ref()
	}

	/// The configured TLS certificate/key paths, if both are present.
	#[must_use]
	pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
		Some((self.tls_cert.as_ref()?, self.tls_key.as_ref()?))
	}

	/// The requested TCP endpoints.
	#[must_use]
	pub fn endpoints(&self) -> &[EndpointSpec] {
		&self.endpoints
	}
}

/// Parse an address sentinel or literal into an [`IpAddr`], if recognized.
/// Used by [`crate::endpoint::resolve_endpoints`].
#[must_use]
pub fn parse_address_literal(address: &str) -> Option<IpAddr> {
	address.parse().ok()
}
