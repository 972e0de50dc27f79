//! # Shipline Output
//!
//! Redis output for the Shipline event shipper: encodes event batches and
//! delivers them to Redis lists or pub/sub channels over plain TCP or TLS.
//!
//! ## Module Organization
//!
//! - `models`: events and batches
//! - `codec`: event serialization with the `@metadata` envelope
//! - `output`: configuration, connection management, delivery and the client
//! - `testing`: in-memory Redis doubles (`test-util` feature)

pub mod codec;
pub mod models;
pub mod output;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

/// Current version of the Shipline output library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
