//! Message distribution built on top of `communication::network`: best
//! effort broadcast, Byzantine-fault-tolerant reliable broadcast, and a
//! purely local variant for single-node deployments and tests.

pub mod besteffort;
pub mod local;
pub mod reliable;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::communication::message::Payload;
use crate::engine::communication::network::BoxFuture;
use crate::engine::communication::NodeId;

/// A final, application-facing delivery callback: given the
/// originator's id and the delivered payload.
pub type DeliverFn<P> = Arc<dyn Fn(NodeId, P) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fans a delivered message out to every registered application
/// receiver, one at a time and in registration order. Shared by every
/// broadcast flavor so application code sees the same delivery
/// contract regardless of which one it's layered over.
pub struct Dispatcher<P: Payload> {
    receivers: Mutex<Vec<DeliverFn<P>>>,
}

impl<P: Payload> Default for Dispatcher<P> {
    fn default() -> Self {
        Dispatcher { receivers: Mutex::new(Vec::new()) }
    }
}

impl<P: Payload> Dispatcher<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an additional receiver. Receivers are never removed;
    /// this crate does not support dynamic unsubscription.
    pub fn add_receiver(&self, receiver: DeliverFn<P>) {
        self.receivers.lock().push(receiver);
    }

    /// Invokes every registered receiver in turn, awaiting each before
    /// starting the next — a single delivered message is never fanned
    /// out concurrently.
    pub async fn deliver(&self, from: NodeId, payload: P) {
        let receivers = self.receivers.lock().clone();
        for receiver in receivers {
            receiver(from.clone(), payload.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn delivers_to_every_receiver_in_order() {
        let dispatcher: Dispatcher<i32> = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            dispatcher.add_receiver(Arc::new(move |_from, _payload| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().push(tag);
                })
            }));
        }

        dispatcher.deliver(NodeId::from("n1"), 7).await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn counts_a_single_delivery_once_per_receiver() {
        let dispatcher: Dispatcher<i32> = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        dispatcher.add_receiver(Arc::new(move |_from, _payload| {
            let count2 = count2.clone();
            Box::pin(async move {
                count2.fetch_add(1, Ordering::SeqCst);
            })
        }));

        dispatcher.deliver(NodeId::from("n1"), 1).await;
        dispatcher.deliver(NodeId::from("n1"), 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
