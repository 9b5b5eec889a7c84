//! Block announcements.
//!
//! Decides, for every change of the active tip, how each connected peer is told about
//! it: with a single `inv`, or with the list of `headers` the peer is missing.
//!
//! Peers start out in *inv-only* mode. Once a peer sends `sendheaders`, new blocks are
//! announced to it with `headers`, diffed against the last header it is known to have.
//! When that diff grows past [`MAX_BLOCKS_TO_ANNOUNCE`], typically after a deep re-org,
//! the peer is sent an `inv` for the new tip instead and announcements to it are
//! *suspended*: every further tip change yields one `inv`, until the peer shows that it
//! caught up, either by fetching headers up to the point of suspension, or by announcing
//! our tip to us.
//!
//! The decision itself, [`decide`], is a pure function of the two tips, the peer's state
//! and the block tree. It performs no I/O; the caller sends the resulting messages and
//! applies the resulting [`Transition`] with [`PeerState::apply`].
//!
use std::num::NonZeroUsize;

use herald_common::bitcoin::network::message::NetworkMessage;
use herald_common::bitcoin::network::message_blockdata::Inventory;
use herald_common::block::tree::ChainView;
use herald_common::block::{BlockHash, BlockHeader, Height};
use herald_common::collections::RandomState;
use herald_common::nonempty::NonEmpty;

use lru::LruCache;

/// Maximum number of headers announced to a peer in one `headers` message. Longer
/// segments are announced with an `inv` for the tip.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;
/// Maximum number of block hashes remembered per peer.
pub const KNOWN_INVENTORY_CAPACITY: usize = 4096;

/// Block hashes a peer is known to have. The least recently seen are forgotten first.
pub type KnownInventory = LruCache<BlockHash, (), RandomState>;

/// Announcement mode of a peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// The peer never asked for headers. Blocks are announced with `inv`.
    InvOnly,
    /// Blocks are announced with `headers`.
    HeadersActive,
    /// The peer fell behind. Blocks are announced with `inv` until it catches up.
    HeadersSuspended,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvOnly => write!(f, "inv-only"),
            Self::HeadersActive => write!(f, "headers"),
            Self::HeadersSuspended => write!(f, "headers (suspended)"),
        }
    }
}

/// Announcement state of a single peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Whether the peer sent `sendheaders`. Never reverts to `false`.
    headers_mode: bool,
    /// Baseline for the next headers diff: the highest header the peer is known to have.
    last_announced: Option<BlockHeader>,
    /// Whether announcements are suspended.
    suspended: bool,
    /// Tip announced with `inv` when the suspension began.
    suspension_point: Option<(Height, BlockHash)>,
    /// Blocks the peer is known to have.
    known: KnownInventory,
}

impl PeerState {
    /// Create the state of a newly connected peer.
    ///
    /// *Panics* if `known_capacity` is zero.
    pub fn new(known_capacity: usize, rng: fastrand::Rng) -> Self {
        let capacity = NonZeroUsize::new(known_capacity)
            .expect("PeerState::new: known inventory capacity must be positive");

        Self {
            headers_mode: false,
            last_announced: None,
            suspended: false,
            suspension_point: None,
            known: KnownInventory::with_hasher(capacity, rng.into()),
        }
    }

    /// The peer's announcement mode.
    pub fn mode(&self) -> Mode {
        match (self.headers_mode, self.suspended) {
            (false, _) => Mode::InvOnly,
            (true, false) => Mode::HeadersActive,
            (true, true) => Mode::HeadersSuspended,
        }
    }

    /// Whether the peer asked to be sent `headers`.
    pub fn headers_mode(&self) -> bool {
        self.headers_mode
    }

    /// Whether announcements to this peer are suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The baseline for the next headers diff.
    pub fn last_announced(&self) -> Option<&BlockHeader> {
        self.last_announced.as_ref()
    }

    /// Height and hash of the tip at which announcements were suspended.
    pub fn suspension_point(&self) -> Option<(Height, BlockHash)> {
        self.suspension_point
    }

    /// Whether the peer is known to have the given block.
    pub fn knows(&self, hash: &BlockHash) -> bool {
        self.known.contains(hash)
    }

    /// Switch the peer to headers mode. Returns `false` if it already was.
    pub fn enable_headers(&mut self) -> bool {
        if self.headers_mode {
            return false;
        }
        self.headers_mode = true;
        true
    }

    /// Record that the peer has the given block.
    pub fn mark_known(&mut self, hash: BlockHash) {
        self.known.put(hash, ());
    }

    /// Record that the peer has the given header and its ancestry. Moves the baseline
    /// forward if the header is on the active chain and higher than the baseline; the
    /// baseline never moves backward. Returns whether the baseline moved.
    pub fn advance<T: ChainView>(&mut self, hash: &BlockHash, tree: &T) -> bool {
        if !tree.is_on_active_chain(hash) {
            return false;
        }
        let Some((height, header)) = tree.get_header(hash) else {
            return false;
        };
        let advance = match &self.last_announced {
            Some(baseline) => tree
                .block_height(&baseline.block_hash())
                .map_or(true, |h| height > h),
            // Without a baseline, the previous tip is used. Only the tip itself is
            // as good.
            None => height >= tree.height(),
        };
        if advance {
            self.last_announced = Some(*header);
        }
        advance
    }

    /// Called after a `getheaders` request from the peer was served. `last` is the last
    /// header sent, or our tip if nothing was sent. Returns `true` if announcements were
    /// resumed.
    pub fn served_headers<T: ChainView>(&mut self, last: &BlockHash, tree: &T) -> bool {
        self.advance(last, tree);

        match self.suspension_point {
            Some((height, _)) if self.suspended => {
                let reached = tree.is_on_active_chain(last)
                    && tree.block_height(last).map_or(false, |h| h >= height);

                if reached {
                    self.resume();
                }
                reached
            }
            _ => false,
        }
    }

    /// Called when the peer announced a block to us, via `inv` or `headers`. Returns
    /// `true` if announcements were resumed.
    pub fn received_announcement<T: ChainView>(&mut self, hash: &BlockHash, tree: &T) -> bool {
        self.mark_known(*hash);
        self.advance(hash, tree);

        let (tip, _) = tree.tip();
        if self.suspended && *hash == tip {
            self.resume();
            return true;
        }
        false
    }

    /// Apply a decision: record what was announced, and transition.
    pub fn apply(&mut self, decision: &Decision) {
        match &decision.announcement {
            Some(Announcement::Inv(hash)) => {
                self.known.put(*hash, ());
            }
            Some(Announcement::Headers(headers)) => {
                for header in headers.iter() {
                    self.known.put(header.block_hash(), ());
                }
            }
            None => {}
        }
        match decision.transition {
            Transition::None => {}
            Transition::Advance(header) => {
                self.last_announced = Some(header);
            }
            Transition::Suspend(height, hash) => {
                assert!(
                    self.headers_mode,
                    "PeerState::apply: only peers in headers mode can be suspended"
                );
                self.suspended = true;
                self.suspension_point = Some((height, hash));
            }
        }
    }

    fn resume(&mut self) {
        self.suspended = false;
        self.suspension_point = None;
    }
}

/// What to send to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// A single-element `inv` for the given block.
    Inv(BlockHash),
    /// The given headers, ancestor first.
    Headers(NonEmpty<BlockHeader>),
}

/// Change to apply to a peer's state after an announcement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changes.
    None,
    /// The peer was sent headers up to the given tip.
    Advance(BlockHeader),
    /// The peer fell behind: announcements are suspended at the given tip.
    Suspend(Height, BlockHash),
}

/// The outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// What to send, if anything.
    pub announcement: Option<Announcement>,
    /// How the peer's state changes.
    pub transition: Transition,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            announcement: None,
            transition: Transition::None,
        }
    }
}

impl Decision {
    /// The wire messages to send, in order.
    pub fn messages(&self) -> Vec<NetworkMessage> {
        match &self.announcement {
            Some(Announcement::Inv(hash)) => {
                vec![NetworkMessage::Inv(vec![Inventory::Block(*hash)])]
            }
            Some(Announcement::Headers(headers)) => {
                vec![NetworkMessage::Headers(headers.iter().cloned().collect())]
            }
            None => vec![],
        }
    }

    /// An `inv` for the tip, unless the peer already has it.
    fn inv(tip: &BlockHash, peer: &PeerState, transition: Transition) -> Self {
        Self {
            announcement: (!peer.knows(tip)).then_some(Announcement::Inv(*tip)),
            transition,
        }
    }
}

/// Decide how to announce a change of the active tip from `old_tip` to `new_tip` to a
/// peer. At most `max` headers are announced at once.
///
/// *Panics* if either tip, or the peer's baseline, is unknown to the tree.
///
pub fn decide<T: ChainView>(
    old_tip: &BlockHash,
    new_tip: &BlockHash,
    peer: &PeerState,
    tree: &T,
    max: usize,
) -> Decision {
    if !peer.headers_mode {
        return Decision::inv(new_tip, peer, Transition::None);
    }
    let baseline = peer
        .last_announced
        .map(|h| h.block_hash())
        .unwrap_or(*old_tip);

    // Re-orgs are measured from the fork point, not from the baseline.
    let fork = tree.fork_point(&baseline, new_tip);
    let fork_height = tree
        .block_height(&fork)
        .expect("decide: the fork point is known");
    let tip_height = tree
        .block_height(new_tip)
        .expect("decide: the new tip is known");
    let length = (tip_height - fork_height) as usize;

    if length == 0 {
        return Decision::default();
    }
    if peer.suspended {
        return Decision::inv(new_tip, peer, Transition::None);
    }
    // The peer announced the tip to us, so it has the whole segment.
    if peer.knows(new_tip) {
        let (_, header) = tree
            .get_header(new_tip)
            .expect("decide: the new tip is known");

        return Decision {
            announcement: None,
            transition: Transition::Advance(*header),
        };
    }
    if length > max {
        return Decision::inv(new_tip, peer, Transition::Suspend(tip_height, *new_tip));
    }
    let segment = NonEmpty::from_vec(tree.ancestors_since(&fork, new_tip))
        .expect("decide: the segment is not empty");
    let tip = *segment.last();

    Decision {
        announcement: Some(Announcement::Headers(segment)),
        transition: Transition::Advance(tip),
    }
}
