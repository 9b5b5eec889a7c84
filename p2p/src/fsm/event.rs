//! State machine events.
use std::fmt;

use herald_common::bitcoin::BlockHash;
use herald_net::Disconnect;

use crate::fsm::{self, DisconnectReason, Height, Link, LocalTime, PeerId};

/// A peer-to-peer event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node is initializing its state machine and about to start network activity.
    Initializing,
    /// The node is initialized and ready to receive commands.
    Ready {
        /// Block header height.
        height: Height,
        /// Block header hash.
        hash: BlockHash,
        /// Local time.
        time: LocalTime,
    },
    /// A peer connected.
    PeerConnected {
        /// Peer address.
        addr: PeerId,
        /// Connection direction.
        link: Link,
    },
    /// A peer disconnected. Its announcement state is dropped.
    PeerDisconnected {
        /// Peer address.
        addr: PeerId,
        /// Reason for the disconnection.
        reason: Disconnect<DisconnectReason>,
    },
    /// A sync manager event.
    Chain(fsm::ChainEvent),
    /// An announcement manager event.
    Announce(fsm::AnnounceEvent),
    /// An inventory manager event.
    Inventory(fsm::InventoryEvent),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing peer-to-peer system.."),
            Self::Ready { height, hash, .. } => {
                write!(f, "Ready to process events and commands (tip = {hash} at height {height})")
            }
            Self::PeerConnected { addr, link } => {
                write!(f, "{addr}: Peer connected ({link:?})")
            }
            Self::PeerDisconnected { addr, reason } => {
                write!(f, "{addr}: Peer disconnected: {reason}")
            }
            Self::Chain(e) => e.fmt(f),
            Self::Announce(e) => e.fmt(f),
            Self::Inventory(e) => e.fmt(f),
        }
    }
}

impl From<fsm::ChainEvent> for Event {
    fn from(e: fsm::ChainEvent) -> Self {
        Self::Chain(e)
    }
}

impl From<fsm::AnnounceEvent> for Event {
    fn from(e: fsm::AnnounceEvent) -> Self {
        Self::Announce(e)
    }
}

impl From<fsm::InventoryEvent> for Event {
    fn from(e: fsm::InventoryEvent) -> Self {
        Self::Inventory(e)
    }
}
