//! TLS certificate loading and hot-reload for the secure module.
//!
//! Built on the `rustls` 0.23 API (`pki_types::CertificateDer`/
//! `PrivateKeyDer` rather than the older `Certificate`/`PrivateKey` wrapper
//! types), with a single-certificate (not SNI-keyed) resolver.

use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	fs,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use crossbeam_channel::{unbounded, Receiver};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio_rustls::rustls::{
	crypto::ring::sign::any_supported_type,
	pki_types::{CertificateDer, PrivateKeyDer},
	server::{ClientHello, ResolvesServerCert},
	sign::CertifiedKey,
};
use tracing::{debug, error, warn};

use crate::error::CertKeyError;

/// Read a `CertifiedKey` from a PEM-encoded certificate chain and PKCS#8
/// private key.
///
/// # IO
/// This function performs synchronous (blocking) file IO and should not be
/// called from an async context without `spawn_blocking`.
pub fn get_certkey(
	cert_path: impl AsRef<Path>,
	key_path: impl AsRef<Path>,
) -> Result<CertifiedKey, CertKeyError> {
	let cert_bytes = fs::read(&cert_path)?;
	let key_bytes = fs::read(&key_path)?;

	let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_bytes[..])
		.collect::<Result<_, _>>()?;

	let key = rustls_pemfile::pkcs8_private_keys(&mut &key_bytes[..])
		.next()
		.ok_or(CertKeyError::NoKey)??;
	let key = PrivateKeyDer::from(key);

	let signing_key = any_supported_type(&key)?;

	Ok(CertifiedKey::new(certs, signing_key))
}

/// A [`ResolvesServerCert`] implementation resolving a single, updatable
/// `CertifiedKey`. If the current certificate is `None`, the handshake is
/// aborted, matching `rustls`'s documented behavior for a `None` resolution.
pub struct CertificateResolver {
	current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertificateResolver {
	/// Create a new resolver from an initial (possibly absent) cert-key pair.
	#[must_use]
	pub const fn new(certkey: Option<Arc<CertifiedKey>>) -> Self {
		Self {
			current: RwLock::new(certkey),
		}
	}

	/// The current `CertifiedKey`, if any.
	pub fn get(&self) -> Option<Arc<CertifiedKey>> {
		self.current.read().clone()
	}

	/// Replace the stored cert-key pair.
	pub fn update(&self, certkey: Option<Arc<CertifiedKey>>) {
		*self.current.write() = certkey;
	}
}

impl ResolvesServerCert for CertificateResolver {
	fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		self.get()
	}
}

impl Debug for CertificateResolver {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("CertificateResolver")
			.field("current", &"Arc<[REDACTED]>")
			.finish()
	}
}

/// Watches a certificate/key file pair for changes and reloads the resolver
/// in place. Returned so the caller can keep the underlying `notify` watcher
/// alive for as long as hot-reload is wanted.
pub struct CertWatcher {
	_watcher: RecommendedWatcher,
}

impl CertWatcher {
	/// Start watching `cert_path`/`key_path`, updating `resolver` on change.
	///
	/// # Errors
	/// Returns an error if the underlying filesystem watcher could not be
	/// installed.
	pub fn spawn(
		cert_path: PathBuf,
		key_path: PathBuf,
		resolver: Arc<CertificateResolver>,
	) -> notify::Result<Self> {
		let (tx, rx): (_, Receiver<notify::Result<notify::Event>>) = unbounded();

		let mut watcher = notify::recommended_watcher(move |event| {
			let _ = tx.send(event);
		})?;

		watcher.watch(&cert_path, RecursiveMode::NonRecursive)?;
		watcher.watch(&key_path, RecursiveMode::NonRecursive)?;

		std::thread::spawn(move || {
			while let Ok(event) = rx.recv() {
				match event {
					Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
						// debounce: a single save often emits several events in
						// quick succession; wait briefly for them to settle.
						std::thread::sleep(Duration::from_millis(100));
						while rx.try_recv().is_ok() {}

						match get_certkey(&cert_path, &key_path) {
							Ok(certkey) => {
								debug!("reloaded TLS certificate");
								resolver.update(Some(Arc::new(certkey)));
							}
							Err(err) => warn!(error = %err, "failed to reload TLS certificate, keeping previous"),
						}
					}
					Ok(_) => {}
					Err(err) => error!(error = %err, "certificate file watcher error"),
				}
			}
		});

		Ok(Self { _watcher: watcher })
	}
}
