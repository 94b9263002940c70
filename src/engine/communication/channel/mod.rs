//! Thin wrapper around the async runtime's bounded MPSC channel,
//! giving the rest of the crate one name to depend on instead of
//! `tokio::sync::mpsc` directly.

use tokio::sync::mpsc;

pub type ChannelTx<T> = mpsc::Sender<T>;
pub type ChannelRx<T> = mpsc::Receiver<T>;

/// Creates a new bounded channel with capacity `bound`.
pub fn new_channel<T>(bound: usize) -> (ChannelTx<T>, ChannelRx<T>) {
    mpsc::channel(bound)
}
