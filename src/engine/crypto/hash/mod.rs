//! Wrapper module around the chosen digest backend.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
pub use self::sha2::*;
