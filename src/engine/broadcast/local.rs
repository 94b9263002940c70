//! Degenerate single-node broadcast strategy: `broadcast(m)` delivers
//! `m` directly, without touching a `Network` at all. Useful for
//! single-replica deployments and for tests that don't want to pay for
//! socket setup.

use std::sync::Arc;

use crate::engine::broadcast::Dispatcher;
use crate::engine::communication::message::Payload;
use crate::engine::communication::NodeId;

pub struct LocalBroadcast<P: Payload> {
    self_id: NodeId,
    dispatcher: Arc<Dispatcher<P>>,
}

impl<P: Payload> LocalBroadcast<P> {
    pub fn new(self_id: NodeId, dispatcher: Arc<Dispatcher<P>>) -> Self {
        LocalBroadcast { self_id, dispatcher }
    }

    /// Delivers `payload` to every locally registered receiver,
    /// attributed to this node. There is nothing else to broadcast to.
    pub async fn broadcast(&self, payload: P) {
        self.dispatcher.deliver(self.self_id.clone(), payload).await;
    }
}
