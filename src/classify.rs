//! The first-byte protocol classifier.
//!
//! This is a pure, total function from one byte to a [`PlaintextProtocol`]
//! (or `None` if the byte does not match any known protocol). It is applied
//! to the first classifiable byte of every client connection, whether that
//! byte arrives directly or is produced by the TLS unwrap layer.

/// The plaintext protocol families the classifier can recognize. At most one
/// of these is ever latched onto a [`crate::client::Client`]; `SECURE` is
/// tracked separately (see [`crate::client::ProtocolMask`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PlaintextProtocol {
	/// The native PCP (Performance Co-Pilot) binary protocol, recognized by
	/// the leading byte `'p'`.
	Pcp,
	/// HTTP/1.x and HTTP/2 (h2c), recognized by an HTTP request method's
	/// first byte.
	Http,
	/// RESP, the Redis serialization protocol, recognized by a leading type
	/// prefix byte.
	Redis,
}

/// The outcome of classifying a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
	/// The byte identifies a plaintext protocol.
	Plaintext(PlaintextProtocol),
	/// The byte is a TLS record type; the connection should be routed
	/// through the secure module before being classified again.
	Secure,
	/// The byte does not match any known protocol.
	Unknown,
}

/// Classify a single byte, the first of a new client's inbound stream (or the
/// first plaintext byte produced by the TLS unwrap layer).
///
/// This function is total and deterministic: the same byte always produces
/// the same [`Classification`], and every possible byte value is handled.
#[must_use]
pub const fn classify(byte: u8) -> Classification {
	match byte {
		b'p' => Classification::Plaintext(PlaintextProtocol::Pcp),
		b'G' | b'H' | b'P' | b'D' | b'T' | b'O' | b'C' => {
			Classification::Plaintext(PlaintextProtocol::Http)
		}
		b'-' | b'+' | b':' | b'$' | b'*' => Classification::Plaintext(PlaintextProtocol::Redis),
		0x14..=0x18 => Classification::Secure,
		_ => Classification::Unknown,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pcp_byte() {
		assert_eq!(
			classify(b'p'),
			Classification::Plaintext(PlaintextProtocol::Pcp)
		);
	}

	#[test]
	fn http_verbs() {
		for b in [b'G', b'H', b'P', b'D', b'T', b'O', b'C'] {
			assert_eq!(
				classify(b),
				Classification::Plaintext(PlaintextProtocol::Http),
				"byte {b:#x} should classify as HTTP"
			);
		}
	}

	#[test]
	fn resp_prefixes() {
		for b in [b'-', b'+', b':', b'$', b'*'] {
			assert_eq!(
				classify(b),
				Classification::Plaintext(PlaintextProtocol::Redis),
				"byte {b:#x} should classify as REDIS"
			);
		}
	}

	#[test]
	fn tls_record_types() {
		for b in 0x14u8..=0x18 {
			assert_eq!(classify(b), Classification::Secure, "byte {b:#x} should classify as SECURE");
		}
	}

	#[test]
	fn unknown_byte() {
		assert_eq!(classify(0x00), Classification::Unknown);
		assert_eq!(classify(b'z'), Classification::Unknown);
	}

	#[test]
	fn deterministic_and_total() {
		// every byte value must produce a well-defined classification, and
		// must always produce the same one
		for b in 0..=u8::MAX {
			assert_eq!(classify(b), classify(b));
		}
	}
}
