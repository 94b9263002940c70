use std::future::Future;
use std::sync::OnceLock;

use crate::engine::error::*;

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;

pub type Runtime = ::tokio::runtime::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Builds a multi-threaded `tokio` runtime with `num_threads` worker
/// threads and installs it as the ambient runtime used by `spawn()`
/// and `block_on()`.
pub fn init(num_threads: usize) -> Result<()> {
    let rt = ::tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads.max(1))
        .thread_name("meshcast-worker")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
        .simple(ErrorKind::Communication)?;
    // a previous `init()` may have already installed a runtime; that's
    // fine, we keep using the first one, mirroring `INITIALIZED`'s
    // idempotent semantics in `engine::init`.
    let _ = RUNTIME.set(rt);
    Ok(())
}

/// Tears down the runtime-global state. `tokio::Runtime` has no
/// explicit handle to release beyond its own `Drop`, so this is a
/// no-op kept for symmetry with `init()`.
pub fn drop() -> Result<()> {
    Ok(())
}

fn handle() -> &'static Runtime {
    RUNTIME.get().expect("async runtime not initialized; call engine::init() first")
}

/// Spawns a future onto the ambient `tokio` runtime.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle().spawn(fut)
}

/// Blocks the current thread until `fut` resolves, driving it on the
/// ambient `tokio` runtime.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    handle().block_on(fut)
}
