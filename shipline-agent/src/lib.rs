//! # Shipline Agent Library
//!
//! Reads newline-delimited JSON events and ships them to Redis through
//! `shipline-output`, owning batching and the retry policy.
//!
//! ## Modules
//!
//! - `config`: layered agent configuration
//! - `forwarder`: stdin batching, publish and retry
//! - `telemetry`: tracing subscriber setup

pub mod config;
pub mod forwarder;
pub mod telemetry;
