//! Inventory manager.
//! Takes care of fetching blocks announced by peers, and of answering block requests.
//!
//! Blocks are requested from the peer that announced them, with a `getdata`. A block
//! is never requested twice while a request for it is pending: duplicate announcements,
//! whether by `inv` or `headers`, and whether by the same peer or another one, are
//! ignored until the block arrives or the request times out. Requests to a peer that
//! disconnects are dropped, so that the next announcement can re-request.
//!
use std::fmt;

use herald_common::bitcoin::network::message_blockdata::Inventory;
use herald_common::block::time::{Clock, LocalDuration, LocalTime};
use herald_common::block::{Block, BlockHash};
use herald_common::collections::HashMap;

use super::output::{Io, Outbox};
use super::PeerId;

/// Time after which a block request is considered lost.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(15);

/// An event emitted by the inventory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Blocks were requested from a peer.
    BlocksRequested {
        /// Peer address.
        addr: PeerId,
        /// Hashes of the blocks requested.
        hashes: Vec<BlockHash>,
    },
    /// A peer asked us for blocks.
    BlocksWanted {
        /// Peer address.
        addr: PeerId,
        /// Hashes of the blocks wanted.
        hashes: Vec<BlockHash>,
    },
    /// A requested block was received.
    BlockReceived {
        /// Peer address.
        from: PeerId,
        /// Block hash.
        hash: BlockHash,
    },
    /// A block request timed out.
    RequestTimedOut {
        /// Peer address.
        addr: PeerId,
        /// Block hash.
        hash: BlockHash,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlocksRequested { addr, hashes } => {
                write!(fmt, "{}: Requested {} block(s)", addr, hashes.len())
            }
            Self::BlocksWanted { addr, hashes } => {
                write!(fmt, "{}: Peer wants {} block(s)", addr, hashes.len())
            }
            Self::BlockReceived { from, hash } => {
                write!(fmt, "{}: Received block {}", from, hash)
            }
            Self::RequestTimedOut { addr, hash } => {
                write!(fmt, "{}: Request for block {} timed out", addr, hash)
            }
        }
    }
}

/// A pending block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Request {
    /// Peer the block was requested from.
    addr: PeerId,
    /// Time at which the request was sent.
    sent_at: LocalTime,
}

/// Inventory manager state.
#[derive(Debug)]
pub struct InventoryManager<C> {
    /// Blocks requested, and from whom.
    remaining: HashMap<BlockHash, Request>,
    /// Timeout of block requests.
    timeout: LocalDuration,

    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for InventoryManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> InventoryManager<C> {
    /// Create a new inventory manager.
    pub fn new(timeout: LocalDuration, rng: fastrand::Rng, outbox: Outbox, clock: C) -> Self {
        Self {
            remaining: HashMap::with_hasher(rng.into()),
            timeout,
            outbox,
            clock,
        }
    }

    /// Whether a request for the given block is pending.
    pub fn is_requested(&self, hash: &BlockHash) -> bool {
        self.remaining.contains_key(hash)
    }

    /// Request blocks from a peer, skipping those for which a request is pending.
    /// Returns the hashes requested.
    pub fn get_blocks(
        &mut self,
        addr: PeerId,
        hashes: impl IntoIterator<Item = BlockHash>,
    ) -> Vec<BlockHash> {
        let sent_at = self.clock.local_time();
        let mut requested = Vec::new();

        for hash in hashes {
            if self.remaining.contains_key(&hash) {
                log::debug!(target: "p2p", "Block {} is already being requested", hash);
                continue;
            }
            self.remaining.insert(hash, Request { addr, sent_at });
            requested.push(hash);
        }
        if requested.is_empty() {
            return requested;
        }
        self.outbox.get_data(
            addr,
            requested.iter().copied().map(Inventory::Block).collect(),
        );
        self.outbox.set_timer(self.timeout);
        self.outbox.event(Event::BlocksRequested {
            addr,
            hashes: requested.clone(),
        });

        requested
    }

    /// Called when a `getdata` is received from a peer.
    pub fn received_getdata(&mut self, addr: PeerId, invs: &[Inventory]) {
        let hashes = invs
            .iter()
            .filter_map(|inv| match inv {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => Some(*hash),
                _ => None,
            })
            .collect::<Vec<_>>();

        if !hashes.is_empty() {
            self.outbox.event(Event::BlocksWanted { addr, hashes });
        }
    }

    /// Called when a block is received from a peer. Returns `true` if it was requested.
    pub fn received_block(&mut self, from: &PeerId, block: &Block) -> bool {
        let hash = block.block_hash();

        // Nb. The block may come from a different peer than the one we asked.
        if self.remaining.remove(&hash).is_none() {
            log::debug!(target: "p2p", "{}: Received unsolicited block {}", from, hash);
            return false;
        }
        self.outbox.event(Event::BlockReceived { from: *from, hash });

        true
    }

    /// Called when a peer disconnected. Drops the requests pending with this peer.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.remaining.retain(|_, req| req.addr != *addr);
    }

    /// Called when a timer expired. Drops the requests that timed out.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();
        let timeout = self.timeout;
        let mut timed_out = Vec::new();

        self.remaining.retain(|hash, req| {
            if now - req.sent_at >= timeout {
                timed_out.push((req.addr, *hash));
                false
            } else {
                true
            }
        });
        for (addr, hash) in timed_out {
            self.outbox.event(Event::RequestTimedOut { addr, hash });
        }
    }
}
