//! Concrete [`crate::module::ProtocolModule`] implementations.
//!
//! `pcp`, `http`, and `redis` are thin pass-throughs: full protocol parsing
//! is out of scope for this crate, so each module only logs and counts what
//! it receives, exercising the contract a real handler would plug into.
//! `secure` is the one module whose body does real work, since TLS
//! pass-through is part of the read demultiplexer.

pub mod http;
pub mod pcp;
pub mod redis;
pub mod secure;
