//! `meshcast` — the message-distribution core of a toolkit for
//! replicated CRDT state.
//!
//! This crate delivers application payloads (opaquely serializable
//! values, addressed to named replicas) to every correct participant
//! of a fixed membership, under two fault assumptions, and routes
//! delivered payloads to the correct local replica:
//!
//! - [`broadcast::ReliableBroadcast`] — a Byzantine-fault-tolerant
//!   reliable broadcast (Bracha-style three-phase: initial → echo →
//!   ready).
//! - [`broadcast::BestEffortBroadcast`] — a baseline delivery
//!   primitive assuming an honest, reachable membership.
//! - [`broadcast::LocalBroadcast`] — the degenerate single-node case.
//! - [`router::CachedRouter`] — demultiplexes delivered payloads to
//!   per-target receivers, materializing a target lazily on first
//!   unsolicited delivery.
//! - [`communication::network::PlainNetwork`] /
//!   [`communication::network::EncryptedNetwork`] — the point-to-point
//!   transports the broadcast strategies run over.
//! - [`communication::barrier`] — a bootstrap barrier blocking a node
//!   until every listed peer has signaled readiness.
//!
//! Deliberately out of scope: the CRDT algebra itself (types, states,
//! merge functions — this crate only sees opaque target identifiers
//! and opaque payloads), any CRDT factory façade, HTTP transport, and
//! key-file generation tooling beyond what
//! [`crypto::rsa::generate_keypair_files`] exposes.

#[cfg(not(feature = "expose_impl"))]
mod engine;

#[cfg(feature = "expose_impl")]
pub mod engine;

pub use engine::{init, InitConfig, InitGuard};

pub mod error {
    //! The `Error`/`ErrorKind`/`Result` triad used throughout this
    //! crate, and the `Result`-extension traits used to build one from
    //! a foreign error or from scratch.
    pub use crate::engine::error::*;
}

pub mod communication {
    //! Node identity, fixed membership, wire framing, and the two
    //! `Network` implementations built on top of it.
    pub use crate::engine::communication::{
        Membership, NodeId, Peer, NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC,
    };

    pub mod barrier {
        pub use crate::engine::communication::barrier::await_ready;
    }

    pub mod message {
        pub use crate::engine::communication::message::{
            AnnotatedMessage, MessageFingerprint, MessageWithId, Payload, TopicBody,
        };
    }

    pub mod network {
        pub use crate::engine::communication::network::{
            BoxFuture, EncryptedNetwork, EncryptedNetworkConfig, GetPublicKeyFilePath, Network,
            NetworkConfig, NetworkExt, PlainNetwork, RawReceiver,
        };
    }
}

pub mod broadcast {
    //! Message distribution strategies layered over a [`Network`]:
    //! best effort, Byzantine reliable, and purely local.
    //!
    //! [`Network`]: crate::communication::network::Network
    pub use crate::engine::broadcast::besteffort::BestEffortBroadcast;
    pub use crate::engine::broadcast::local::LocalBroadcast;
    pub use crate::engine::broadcast::reliable::ReliableBroadcast;
    pub use crate::engine::broadcast::{DeliverFn, Dispatcher};
}

pub mod router {
    //! The cached router: demultiplexes delivered payloads to
    //! per-target receivers.
    pub use crate::engine::router::{AnnotatedPayload, BroadcastFn, CachedRouter, Factory, TargetRef};
}

pub mod crypto {
    //! Cryptographic primitives backing the encrypted transport and
    //! message fingerprinting: RSA keypair management and chunked
    //! encryption, AES-256-CBC session encryption, and SHA-256
    //! hashing.
    pub mod rsa {
        pub use crate::engine::crypto::rsa::{
            decrypt, decrypt_chunked, encrypt, encrypt_chunked, generate_keypair_files,
            read_private_key_file, read_public_key_file, DEFAULT_KEY_BITS,
        };
    }

    pub mod aes {
        pub use crate::engine::crypto::aes::{decrypt, encrypt, SessionKey, IV_LEN, KEY_LEN};
    }

    pub mod hash {
        pub use crate::engine::crypto::hash::Digest;
    }
}

/// Installs a `tracing` subscriber for the handful of tests whose
/// assertions depend on timing (network reconnects, barrier
/// readiness) and are easier to debug with the crate's own
/// `debug!`/`warn!` trace visible. The library itself never installs
/// one — only tests do, and only on demand.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
