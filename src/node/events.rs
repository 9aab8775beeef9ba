//! Host capability seam
//!
//! The processor's only escape to the outside world: it asks for missing
//! data, reports peers that sent provably bad bytes, and announces tip
//! advances. The host wires these to its transport; tests record them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::consensus::StateId;

/// Opaque peer identity assigned by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Event sinks the host overrides
pub trait NodeEvents {
    /// Ask the network for a header (`want_block == false`) or a body
    ///
    /// `preferred_peer` is the peer that last supplied an ancestor on the
    /// same candidate branch, when one is known.
    fn request_data(&mut self, id: StateId, want_block: bool, preferred_peer: Option<PeerId>);

    /// A peer sent data failing structural or cryptographic checks
    fn on_peer_insane(&mut self, peer: PeerId);

    /// The canonical tip advanced
    fn on_new_state(&mut self);
}

/// Sink that ignores every event; for tools and offline replay
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl NodeEvents for NullEvents {
    fn request_data(&mut self, _id: StateId, _want_block: bool, _preferred_peer: Option<PeerId>) {}
    fn on_peer_insane(&mut self, _peer: PeerId) {}
    fn on_new_state(&mut self) {}
}
