//! The Endpoint Set: expanding a configured list of `(address, port)` entries
//! and an optional local socket path into a concrete list of bind targets.

use std::{
	fmt,
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
	path::PathBuf,
};

use crate::config::EndpointSpec;

/// A single concrete bind target produced by [`resolve_endpoints`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
	/// A TCP endpoint, IPv4 or IPv6.
	Tcp(SocketAddr),
	/// A local (Unix domain socket) filesystem endpoint.
	Local(PathBuf),
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Tcp(addr) => write!(f, "tcp:{addr}"),
			Self::Local(path) => write!(f, "local:{}", path.display()),
		}
	}
}

/// Expand a configured endpoint list and optional local socket path into the
/// concrete set of bind targets a [`crate::proxy::Proxy`] should attempt.
///
/// Sentinel addresses (`None`, `"INADDR_ANY"`, `"INADDR_LOOPBACK"`) expand to
/// their IPv4 form and, if `ipv6` is enabled, their IPv6 companion. Any other
/// literal address is parsed and kept as-is; unparseable addresses are
/// dropped (and logged by the caller, which sees them missing from the
/// result rather than as an explicit error).
#[must_use]
pub fn resolve_endpoints(specs: &[EndpointSpec], ipv6: bool) -> Vec<Endpoint> {
	let mut endpoints = Vec::new();

	for spec in specs {
		match spec.address.as_deref() {
			None | Some("INADDR_ANY") => {
				endpoints.push(Endpoint::Tcp(SocketAddr::new(
					IpAddr::V4(Ipv4Addr::UNSPECIFIED),
					spec.port,
				)));
				if ipv6 {
					endpoints.push(Endpoint::Tcp(SocketAddr::new(
						IpAddr::V6(Ipv6Addr::UNSPECIFIED),
						spec.port,
					)));
				}
			}
			Some("INADDR_LOOPBACK") => {
				endpoints.push(Endpoint::Tcp(SocketAddr::new(
					IpAddr::V4(Ipv4Addr::LOCALHOST),
					spec.port,
				)));
				if ipv6 {
					endpoints.push(Endpoint::Tcp(SocketAddr::new(
						IpAddr::V6(Ipv6Addr::LOCALHOST),
						spec.port,
					)));
				}
			}
			Some(literal) => match crate::config::parse_address_literal(literal) {
				Some(address) => endpoints.push(Endpoint::Tcp(SocketAddr::new(address, spec.port))),
				None => tracing::warn!(address = literal, "dropping unparseable endpoint address"),
			},
		}
	}

	endpoints
}

/// Append the local socket endpoint, if configured, to an endpoint list
/// already produced by [`resolve_endpoints`]. Kept as a separate step so
/// callers that only want the TCP set (e.g. `--dump` previews) can skip it.
pub fn with_local_socket(mut endpoints: Vec<Endpoint>, local_socket: Option<&PathBuf>) -> Vec<Endpoint> {
	if let Some(path) = local_socket {
		endpoints.push(Endpoint::Local(path.clone()));
	}
	endpoints
}
