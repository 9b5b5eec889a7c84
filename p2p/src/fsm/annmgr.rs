//!
//! Announcement manager.
//!
//! Owns the announcement state of every connected peer. Inbound messages that tell us
//! something about what a peer knows are fed in here, and every change of the active
//! tip is fanned out to all peers through [`announce::decide`].
//!
use std::fmt;

use herald_common::block::tree::ChainView;
use herald_common::block::{BlockHash, Height};
use herald_common::collections::HashMap;

use super::announce::{self, Announcement, PeerState, Transition};
use super::output::{Io, Outbox};
use super::PeerId;

/// How a block was announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    /// A single-element `inv`.
    Inv,
    /// A `headers` message with the given number of headers.
    Headers(usize),
}

/// An event emitted by the announcement manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer asked to be sent `headers`.
    HeadersNegotiated {
        /// Peer address.
        addr: PeerId,
    },
    /// A new tip was announced to a peer.
    BlockAnnounced {
        /// Peer address.
        addr: PeerId,
        /// Hash of the announced tip.
        hash: BlockHash,
        /// Height of the announced tip.
        height: Height,
        /// How it was announced.
        via: Via,
    },
    /// The peer fell too far behind to be sent headers.
    AnnouncementsSuspended {
        /// Peer address.
        addr: PeerId,
        /// Height of the tip at which we stopped sending headers.
        height: Height,
        /// Hash of the tip at which we stopped sending headers.
        hash: BlockHash,
    },
    /// The peer caught up and will be sent headers again.
    AnnouncementsResumed {
        /// Peer address.
        addr: PeerId,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeadersNegotiated { addr } => {
                write!(fmt, "{}: Peer requested headers announcements", addr)
            }
            Self::BlockAnnounced {
                addr,
                hash,
                height,
                via: Via::Inv,
            } => write!(fmt, "{}: Announced block {} at height {} (inv)", addr, hash, height),
            Self::BlockAnnounced {
                addr,
                hash,
                height,
                via: Via::Headers(n),
            } => write!(
                fmt,
                "{}: Announced block {} at height {} ({} header(s))",
                addr, hash, height, n
            ),
            Self::AnnouncementsSuspended { addr, height, hash } => write!(
                fmt,
                "{}: Headers announcements suspended at block {} (height = {})",
                addr, hash, height
            ),
            Self::AnnouncementsResumed { addr } => {
                write!(fmt, "{}: Headers announcements resumed", addr)
            }
        }
    }
}

/// Announcement manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of headers announced at once.
    pub max_blocks_to_announce: usize,
    /// Maximum number of block hashes remembered per peer.
    pub known_inventory_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_blocks_to_announce: announce::MAX_BLOCKS_TO_ANNOUNCE,
            known_inventory_capacity: announce::KNOWN_INVENTORY_CAPACITY,
        }
    }
}

/// Announcement manager state.
#[derive(Debug)]
pub struct AnnounceManager {
    /// Announcement manager configuration.
    pub config: Config,

    /// Announcement state of each connected peer.
    peers: HashMap<PeerId, PeerState>,
    rng: fastrand::Rng,
    outbox: Outbox,
}

impl Iterator for AnnounceManager {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl AnnounceManager {
    /// Create a new announcement manager.
    pub fn new(config: Config, rng: fastrand::Rng, outbox: Outbox) -> Self {
        Self {
            config,
            peers: HashMap::with_hasher(rng.clone().into()),
            rng,
            outbox,
        }
    }

    /// Get the announcement state of a peer.
    pub fn peer(&self, addr: &PeerId) -> Option<&PeerState> {
        self.peers.get(addr)
    }

    /// Called when a peer connected. Any previous state is discarded.
    pub fn peer_connected(&mut self, addr: PeerId) {
        let state = PeerState::new(self.config.known_inventory_capacity, self.rng.clone());

        self.peers.insert(addr, state);
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
    }

    /// Called when a `sendheaders` message was received.
    pub fn received_sendheaders(&mut self, addr: &PeerId) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if peer.enable_headers() {
            self.outbox.event(Event::HeadersNegotiated { addr: *addr });
        } else {
            log::debug!(target: "p2p", "{}: Ignoring repeated `sendheaders`", addr);
        }
    }

    /// Whether a peer is known to have the given block.
    pub fn knows(&self, addr: &PeerId, hash: &BlockHash) -> bool {
        self.peers.get(addr).map_or(false, |p| p.knows(hash))
    }

    /// Record blocks announced by a peer, before they are imported.
    pub fn mark_known(&mut self, addr: &PeerId, hashes: impl IntoIterator<Item = BlockHash>) {
        if let Some(peer) = self.peers.get_mut(addr) {
            for hash in hashes {
                peer.mark_known(hash);
            }
        }
    }

    /// Called after a `getheaders` request was served to a peer. `last` is the last header
    /// sent, or our tip if nothing was sent.
    pub fn served_headers<T: ChainView>(&mut self, addr: &PeerId, last: &BlockHash, tree: &T) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if peer.served_headers(last, tree) {
                self.outbox
                    .event(Event::AnnouncementsResumed { addr: *addr });
            }
        }
    }

    /// Called when a peer announced blocks to us, via `inv` or `headers`.
    pub fn received_announcements<T: ChainView>(
        &mut self,
        addr: &PeerId,
        hashes: &[BlockHash],
        tree: &T,
    ) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        let mut resumed = false;

        for hash in hashes {
            resumed |= peer.received_announcement(hash, tree);
        }
        if resumed {
            self.outbox
                .event(Event::AnnouncementsResumed { addr: *addr });
        }
    }

    /// Called when the active tip changed. Announces the new tip to every peer.
    pub fn tip_changed<T: ChainView>(&mut self, old: &BlockHash, new: &BlockHash, tree: &T) {
        let height = tree
            .block_height(new)
            .expect("AnnounceManager::tip_changed: the new tip is known");

        for (addr, peer) in self.peers.iter_mut() {
            let decision =
                announce::decide(old, new, peer, tree, self.config.max_blocks_to_announce);

            for msg in decision.messages() {
                self.outbox.message(*addr, msg);
            }
            match &decision.announcement {
                Some(Announcement::Inv(hash)) => self.outbox.event(Event::BlockAnnounced {
                    addr: *addr,
                    hash: *hash,
                    height,
                    via: Via::Inv,
                }),
                Some(Announcement::Headers(headers)) => {
                    self.outbox.event(Event::BlockAnnounced {
                        addr: *addr,
                        hash: *new,
                        height,
                        via: Via::Headers(headers.len()),
                    })
                }
                None => {
                    log::debug!(target: "p2p", "{}: Nothing to announce for {}", addr, new);
                }
            }
            if let Transition::Suspend(height, hash) = decision.transition {
                self.outbox.event(Event::AnnouncementsSuspended {
                    addr: *addr,
                    height,
                    hash,
                });
            }
            peer.apply(&decision);
        }
    }
}
