//! Wrapper module around the chosen async runtime backend.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
pub use self::tokio::*;
