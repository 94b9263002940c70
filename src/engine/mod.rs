//! This module contains the implementation details of `meshcast`.
//!
//! By default, it is hidden to the user, unless explicitly enabled
//! with the feature flag `expose_impl`.

pub mod async_runtime;
pub mod broadcast;
pub mod collections;
pub mod communication;
pub mod crypto;
pub mod error;
pub mod router;

use std::ops::Drop;
use std::sync::atomic::{AtomicBool, Ordering};

use error::*;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configure the init process of the library.
pub struct InitConfig {
    /// Number of threads used by the async runtime.
    pub async_threads: usize,
}

/// Handle to the global data.
///
/// When dropped, the data is deinitialized.
pub struct InitGuard;

/// Initializes global data.
///
/// Should always be called before other methods, otherwise runtime
/// panics may ensue.
pub fn init(c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }
    async_runtime::init(c.async_threads)?;
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        drop_impl().ok();
    }
}

fn drop_impl() -> Result<()> {
    INITIALIZED.store(false, Ordering::SeqCst);
    async_runtime::drop()?;
    Ok(())
}
