//! Cached message router: demultiplexes payloads delivered by a
//! broadcast strategy to per-target receivers, materializing a target
//! lazily on first unsolicited delivery.
//!
//! Wraps whichever [`Dispatcher`](crate::engine::broadcast::Dispatcher)
//! a broadcast strategy (best-effort, reliable, or local) fans its
//! deliveries out through: the router registers itself as that
//! dispatcher's single receiver, and re-dispatches each delivered
//! [`AnnotatedPayload`] to the receiver registered for its `target`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::engine::broadcast::{DeliverFn, Dispatcher};
use crate::engine::collections::{self, HashMap};
use crate::engine::communication::message::{canonical_json_bytes, Payload};
use crate::engine::communication::network::BoxFuture;
use crate::engine::communication::NodeId;
use crate::engine::error::*;

/// Bound satisfied by any replica identifier the router demultiplexes
/// on. Compared by canonical serialized form, never by reference —
/// two separately constructed `TargetRef`s with equal fields address
/// the same receiver.
pub trait TargetRef: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> TargetRef for T where T: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {}

/// A payload addressed to a specific replica: `{ target, message }`.
#[derive(Clone, Serialize, serde::Deserialize)]
pub struct AnnotatedPayload<T, P> {
    pub target: T,
    pub message: P,
}

/// The factory a router calls back into on first unsolicited delivery
/// for a target with no registered receiver. Expected, during its own
/// construction, to call [`CachedRouter::add_receiver_for`] on the
/// `CachedRouter` it's handed, registering a receiver for `target`
/// into the same cache the router itself consults.
///
/// This is the cyclic router-to-factory callback design note: the
/// factory is handed a cheap `Arc`-backed clone of the router rather
/// than a long-lived borrow, so its call back into
/// `add_receiver_for` cannot conflict with the router's own lock
/// discipline (the target map's lock is never held across the
/// factory invocation).
pub type Factory<T, P> =
    Arc<dyn Fn(T, CachedRouter<T, P>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Sends an `AnnotatedPayload` out through whichever broadcast
/// strategy backs this router. Adapts `BestEffortBroadcast::broadcast`,
/// `ReliableBroadcast::broadcast`, or `LocalBroadcast::broadcast` —
/// whichever the caller constructed the router over.
pub type BroadcastFn<T, P> =
    Arc<dyn Fn(AnnotatedPayload<T, P>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Inner<T, P> {
    receivers: Mutex<HashMap<String, DeliverFn<P>>>,
    broadcast: BroadcastFn<T, P>,
    factory: Factory<T, P>,
}

/// A cached router bound to one target type `T` and one payload type
/// `P`. Cheap to clone: internally an `Arc`.
pub struct CachedRouter<T, P> {
    inner: Arc<Inner<T, P>>,
}

impl<T, P> Clone for CachedRouter<T, P> {
    fn clone(&self) -> Self {
        CachedRouter { inner: self.inner.clone() }
    }
}

/// Canonical key for a `TargetRef`: its canonical JSON serialization,
/// the same form used for hashing elsewhere in this crate. Two
/// targets with equal fields serialize to the same key regardless of
/// which instance produced them.
fn canonical_key<T: Serialize>(target: &T) -> Result<String> {
    let bytes = canonical_json_bytes(target)?;
    String::from_utf8(bytes).wrapped(ErrorKind::Router)
}

impl<T: TargetRef, P: Payload> CachedRouter<T, P> {
    /// Builds a router over `dispatcher` (the broadcast strategy's
    /// local-delivery fanout) and `broadcast` (how to send a message
    /// out through that same strategy). Registers itself as
    /// `dispatcher`'s demultiplexing receiver.
    pub fn new(
        dispatcher: Arc<Dispatcher<AnnotatedPayload<T, P>>>,
        broadcast: BroadcastFn<T, P>,
        factory: Factory<T, P>,
    ) -> Self {
        let router = CachedRouter {
            inner: Arc::new(Inner {
                receivers: Mutex::new(collections::hash_map()),
                broadcast,
                factory,
            }),
        };

        let demux_router = router.clone();
        dispatcher.add_receiver(Arc::new(move |from, annotated| {
            let router = demux_router.clone();
            Box::pin(async move {
                deliver_to_target(router, from, annotated).await;
            })
        }));

        router
    }

    /// Registers the unique local receiver for `target`. A second
    /// registration for the same target (by canonical form) is a
    /// programmer error: at most one receiver is allowed per target.
    pub fn add_receiver_for(&self, target: T, receiver: DeliverFn<P>) -> Result<()> {
        let key = canonical_key(&target)?;
        let mut receivers = self.inner.receivers.lock();
        if receivers.contains_key(&key) {
            return Err(Error::wrapped(
                ErrorKind::Router,
                format!("a receiver is already registered for this target ({})", key),
            ));
        }
        receivers.insert(key, receiver);
        Ok(())
    }

    /// Broadcasts `{ target, message }` through the underlying
    /// strategy. Every node (including this one, via its own
    /// dispatcher) eventually demultiplexes it to `target`'s receiver.
    pub async fn send_message_to(&self, target: T, message: P) -> Result<()> {
        (self.inner.broadcast)(AnnotatedPayload { target, message }).await
    }
}

async fn deliver_to_target<T: TargetRef, P: Payload>(
    router: CachedRouter<T, P>,
    from: NodeId,
    annotated: AnnotatedPayload<T, P>,
) {
    let key = match canonical_key(&annotated.target) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(error = %e, "dropping delivery: target does not canonicalize");
            return;
        }
    };

    let receiver = router.inner.receivers.lock().get(&key).cloned();
    let receiver = match receiver {
        Some(receiver) => receiver,
        None => {
            (router.inner.factory)(annotated.target.clone(), router.clone()).await;
            match router.inner.receivers.lock().get(&key).cloned() {
                Some(receiver) => receiver,
                None => {
                    // Programmer error: the factory was expected to call
                    // `add_receiver_for` for this exact target during its
                    // own construction and didn't. Nothing downstream can
                    // recover from this, so it surfaces as loudly as
                    // possible rather than being silently dropped like a
                    // malformed frame.
                    panic!(
                        "router: no receiver registered for target {} after materialization; \
                         a CRDT was likely created against a different router instance",
                        key
                    );
                }
            }
        }
    };

    receiver(from, annotated.message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::broadcast::Dispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Serialize, serde::Deserialize)]
    struct Target(String);

    fn immediate_broadcast<T: TargetRef, P: Payload>(
        dispatcher: Arc<Dispatcher<AnnotatedPayload<T, P>>>,
        self_id: NodeId,
    ) -> BroadcastFn<T, P> {
        Arc::new(move |annotated| {
            let dispatcher = dispatcher.clone();
            let self_id = self_id.clone();
            Box::pin(async move {
                dispatcher.deliver(self_id, annotated).await;
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn registered_receiver_fires_exactly_once_per_broadcast() {
        let dispatcher: Arc<Dispatcher<AnnotatedPayload<Target, i32>>> = Arc::new(Dispatcher::new());
        let broadcast = immediate_broadcast(dispatcher.clone(), NodeId::from("n1"));
        let factory: Factory<Target, i32> = Arc::new(|_target, _router| Box::pin(async {}));

        let router = CachedRouter::new(dispatcher, broadcast, factory);

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        router
            .add_receiver_for(
                Target("a".to_owned()),
                Arc::new(move |_from, _msg: i32| {
                    let count2 = count2.clone();
                    Box::pin(async move {
                        count2.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .unwrap();

        router.send_message_to(Target("a".to_owned()), 42).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_for_the_same_target_fails() {
        let dispatcher: Arc<Dispatcher<AnnotatedPayload<Target, i32>>> = Arc::new(Dispatcher::new());
        let broadcast = immediate_broadcast(dispatcher.clone(), NodeId::from("n1"));
        let factory: Factory<Target, i32> = Arc::new(|_target, _router| Box::pin(async {}));
        let router = CachedRouter::new(dispatcher, broadcast, factory);

        router
            .add_receiver_for(Target("a".to_owned()), Arc::new(|_from, _msg: i32| Box::pin(async {})))
            .unwrap();
        let second = router.add_receiver_for(
            Target("a".to_owned()),
            Arc::new(|_from, _msg: i32| Box::pin(async {})),
        );
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn unsolicited_delivery_lazily_materializes_its_target_via_the_factory() {
        let dispatcher: Arc<Dispatcher<AnnotatedPayload<Target, i32>>> = Arc::new(Dispatcher::new());
        let broadcast = immediate_broadcast(dispatcher.clone(), NodeId::from("n1"));

        let count = Arc::new(AtomicUsize::new(0));
        let count_for_factory = count.clone();
        let factory: Factory<Target, i32> = Arc::new(move |target, router| {
            let count_for_factory = count_for_factory.clone();
            Box::pin(async move {
                router
                    .add_receiver_for(
                        target,
                        Arc::new(move |_from, _msg: i32| {
                            let count_for_factory = count_for_factory.clone();
                            Box::pin(async move {
                                count_for_factory.fetch_add(1, Ordering::SeqCst);
                            })
                        }),
                    )
                    .unwrap();
            })
        });

        let router = CachedRouter::new(dispatcher, broadcast, factory);

        // no receiver registered for "b" ahead of time
        router.send_message_to(Target("b".to_owned()), 7).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // the materialized receiver is cached: a second delivery
        // reuses it without calling the factory again
        router.send_message_to(Target("b".to_owned()), 8).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "no receiver registered")]
    async fn a_factory_that_fails_to_register_panics_loudly() {
        let dispatcher: Arc<Dispatcher<AnnotatedPayload<Target, i32>>> = Arc::new(Dispatcher::new());
        let broadcast = immediate_broadcast(dispatcher.clone(), NodeId::from("n1"));
        let factory: Factory<Target, i32> = Arc::new(|_target, _router| Box::pin(async {}));
        let router = CachedRouter::new(dispatcher, broadcast, factory);

        router.send_message_to(Target("never-registers".to_owned()), 1).await.unwrap();
    }
}
