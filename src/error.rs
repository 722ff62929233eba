//! Error types for the proxy core.
//!
//! Most failures in this crate are handled locally (an endpoint is skipped, a
//! client is closed) rather than propagated; these types exist for the few
//! places that do need to report a structured failure to a caller, such as
//! TLS certificate loading and whole-proxy startup.

use std::io::Error as IoError;

/// The error returned when a certificate/key pair can not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum CertKeyError {
	/// The certificate or key file could not be read.
	#[error("the certificate or key file could not be read")]
	Read(#[from] IoError),
	/// The private key file does not contain a valid private key.
	#[error("the private key file does not contain a valid private key")]
	NoKey,
	/// The certificate or key is invalid or unsupported.
	#[error("the certificate or key is invalid or unsupported")]
	InvalidKey(#[from] tokio_rustls::rustls::Error),
}

/// The error returned when setting up a single listening endpoint fails.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
	/// The listening socket could not be created, bound, or configured.
	#[error("could not set up listening socket on {address}: {source}")]
	Socket {
		/// A human-readable description of the endpoint that failed.
		address: String,
		/// The underlying IO error.
		#[source]
		source: IoError,
	},
}

/// The error returned when the proxy as a whole fails to start.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
	/// None of the configured endpoints could be opened.
	#[error("no request ports could be opened, exiting")]
	NoListeningEndpoints,
}
