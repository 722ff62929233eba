#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
	clippy::pedantic,
	clippy::cargo,
	clippy::nursery,
	missing_docs,
	rustdoc::missing_crate_level_docs
)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

//! The accept-and-demultiplex core of a multi-protocol proxy daemon.
//!
//! This crate listens on a configured set of stream endpoints, classifies
//! each accepted connection's first byte into one of a small number of
//! protocol families, and dispatches subsequent reads to the matching
//! [`module::ProtocolModule`] (optionally after passing through a TLS
//! wrap/unwrap layer). Per-protocol parsing and request handling live behind
//! that module boundary, outside this crate.

pub mod certs;
pub mod classify;
pub mod client;
pub mod config;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod module;
pub mod modules;
pub mod proxy;
pub mod signals;
pub mod write;
