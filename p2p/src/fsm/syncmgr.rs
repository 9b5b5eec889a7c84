//!
//! Manages header synchronization with peers.
//!
//! Serves `getheaders` and `getblocks` requests, imports headers received from peers,
//! and asks peers for the headers leading up to blocks they announce.
//!
use std::fmt;

use herald_common::bitcoin::network::message_blockdata::Inventory;
use herald_common::bitcoin_hashes::Hash as _;
use herald_common::block::time::{Clock, LocalDuration, LocalTime};
use herald_common::block::tree::{BlockTree, ChainView, Error, ImportResult};
use herald_common::block::{BlockHash, BlockHeader, Height};
use herald_common::collections::HashMap;

use super::output::{Io, Outbox};
use super::{Locators, PeerId};

/// How long to wait for a request, eg. `getheaders` to be fulfilled.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Maximum number of headers sent in a `headers` message.
pub const MAX_MESSAGE_HEADERS: usize = 2000;
/// Maximum number of inventories sent in reply to a `getblocks` message.
pub const MAX_GETBLOCKS_INVS: usize = 500;
/// Maximum number of inventories accepted in an `inv` message.
pub const MAX_MESSAGE_INVS: usize = 50000;

/// Maximum headers announced in a `headers` message, when unsolicited.
const MAX_UNSOLICITED_HEADERS: usize = 24;

/// An event emitted by the sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A block was added to the main chain.
    BlockConnected {
        /// Block header.
        header: BlockHeader,
        /// Height of the block.
        height: Height,
    },
    /// One of the blocks of the main chain was reverted, due to a re-org.
    BlockDisconnected {
        /// Header of the block.
        header: BlockHeader,
        /// Height of the block when it was part of the main chain.
        height: Height,
    },
    /// A new block header batch was imported and the tip changed.
    BlockHeadersImported {
        /// Import result.
        result: ImportResult,
        /// Set if this import triggered a chain reorganization.
        reorg: bool,
    },
    /// Headers were served to a peer.
    HeadersServed {
        /// Peer address.
        addr: PeerId,
        /// Number of headers sent.
        count: usize,
    },
    /// A peer misbehaved.
    PeerMisbehaved {
        /// Peer address.
        addr: PeerId,
        /// Reason of misbehavior.
        reason: &'static str,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockConnected { height, header } => {
                write!(
                    fmt,
                    "Block {} connected at height {}",
                    header.block_hash(),
                    height
                )
            }
            Self::BlockDisconnected { height, header } => {
                write!(
                    fmt,
                    "Block {} disconnected at height {}",
                    header.block_hash(),
                    height
                )
            }
            Self::BlockHeadersImported {
                result: ImportResult::TipChanged { hash, height, .. },
                reorg,
            } => write!(
                fmt,
                "Chain tip updated to {hash} at height {height} (reorg={reorg})"
            ),
            Self::BlockHeadersImported {
                result: ImportResult::TipUnchanged,
                ..
            } => write!(fmt, "Chain tip unchanged during import"),
            Self::HeadersServed { addr, count } => {
                write!(fmt, "{}: Served {} header(s)", addr, count)
            }
            Self::PeerMisbehaved { addr, reason } => {
                write!(fmt, "{addr}: Peer misbehaved: {reason}")
            }
        }
    }
}

/// Sync manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of headers in a `headers` message.
    pub max_message_headers: usize,
    /// Maximum number of inventories sent in reply to `getblocks`.
    pub max_getblocks_invs: usize,
    /// How long to wait for a response from a peer.
    pub request_timeout: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_headers: MAX_MESSAGE_HEADERS,
            max_getblocks_invs: MAX_GETBLOCKS_INVS,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// A `getheaders` request sent to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
struct GetHeaders {
    /// Locators hashes.
    locators: Locators,
    /// Time at which the request was sent.
    sent_at: LocalTime,
}

/// The sync manager state.
#[derive(Debug)]
pub struct SyncManager<C> {
    /// Sync manager configuration.
    pub config: Config,

    /// In-flight requests to peers.
    inflight: HashMap<PeerId, GetHeaders>,
    /// State-machine output.
    outbox: Outbox,
    /// Clock.
    clock: C,
}

impl<C> Iterator for SyncManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> SyncManager<C> {
    /// Create a new sync manager.
    pub fn new(config: Config, rng: fastrand::Rng, outbox: Outbox, clock: C) -> Self {
        let inflight = HashMap::with_hasher(rng.into());

        Self {
            config,
            inflight,
            outbox,
            clock,
        }
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.inflight.remove(addr);
    }

    /// Called when we received a `getheaders` message from a peer. Replies with the
    /// headers of the active chain following the locators. An empty reply is still sent.
    ///
    /// Returns the hash of the last header sent, or of our tip if none were sent.
    pub fn received_getheaders<T: ChainView>(
        &mut self,
        addr: &PeerId,
        (locator_hashes, stop_hash): Locators,
        tree: &T,
    ) -> BlockHash {
        let max = self.config.max_message_headers;
        let headers = tree.locate_headers(&locator_hashes, stop_hash, max);
        let last = headers
            .last()
            .map(|h| h.block_hash())
            .unwrap_or_else(|| tree.tip().0);

        log::debug!(
            target: "p2p",
            "{}: Serving {} header(s) (stop = {})",
            addr,
            headers.len(),
            stop_hash
        );
        self.outbox.event(Event::HeadersServed {
            addr: *addr,
            count: headers.len(),
        });
        self.outbox.headers(*addr, headers);

        last
    }

    /// Called when we received a `getblocks` message from a peer. Replies with an `inv`
    /// of the active chain's blocks following the locators, skipping blocks for which
    /// `known` returns `true`.
    ///
    /// Returns the hashes sent.
    pub fn received_getblocks<T: ChainView>(
        &mut self,
        addr: &PeerId,
        (locator_hashes, stop_hash): Locators,
        tree: &T,
        known: impl Fn(&BlockHash) -> bool,
    ) -> Vec<BlockHash> {
        if locator_hashes.is_empty() {
            log::debug!(target: "p2p", "{}: Ignoring `getblocks` without locators", addr);
            return vec![];
        }
        let max = self.config.max_getblocks_invs;
        let hashes = tree
            .locate_headers(&locator_hashes, stop_hash, max)
            .into_iter()
            .map(|h| h.block_hash())
            .filter(|h| !known(h))
            .collect::<Vec<_>>();

        if hashes.is_empty() {
            log::debug!(target: "p2p", "{}: Nothing to send in reply to `getblocks`", addr);
            return hashes;
        }
        self.outbox.inv(
            *addr,
            hashes.iter().copied().map(Inventory::Block).collect(),
        );
        hashes
    }

    /// Import blocks into our block tree, emitting an event for every block connected
    /// or disconnected.
    pub fn import_blocks<T: BlockTree, I: Iterator<Item = BlockHeader>>(
        &mut self,
        blocks: I,
        tree: &mut T,
    ) -> Result<ImportResult, Error> {
        let result = tree.import_blocks(blocks);

        if let Ok(
            result @ ImportResult::TipChanged {
                reverted,
                connected,
                ..
            },
        ) = &result
        {
            let reorg = !reverted.is_empty();

            for (height, header) in reverted.iter().cloned() {
                self.outbox
                    .event(Event::BlockDisconnected { height, header });
            }
            for (height, header) in connected.iter().cloned() {
                self.outbox.event(Event::BlockConnected { height, header });
            }
            self.outbox.event(Event::BlockHeadersImported {
                reorg,
                result: result.clone(),
            });
        }
        result
    }

    /// Called when we receive headers from a peer. Returns `None` if the headers were
    /// ignored, and the import result otherwise.
    pub fn received_headers<T: BlockTree>(
        &mut self,
        from: &PeerId,
        headers: Vec<BlockHeader>,
        tree: &mut T,
    ) -> Option<Result<ImportResult, Error>> {
        let request = self.inflight.remove(from);
        let length = headers.len();

        if length == 0 {
            return None;
        }
        if length > self.config.max_message_headers {
            log::debug!(target: "p2p", "Received more than maximum headers allowed from {from}");
            self.record_misbehavior(from, "invalid `headers` message");

            return None;
        }
        // When unsolicited, we don't want to process too many headers in case of a DoS.
        if length > MAX_UNSOLICITED_HEADERS && request.is_none() {
            log::debug!(target: "p2p", "Received {} unsolicited headers from {}", length, from);

            return None;
        }
        log::debug!(target: "p2p", "Received {} block header(s) from {}", length, from);

        let root = headers[0].block_hash();
        let result = self.import_blocks(headers.into_iter(), tree);

        match &result {
            Ok(ImportResult::TipChanged { hash, .. }) => {
                // A full batch means there is probably more to fetch.
                if length == self.config.max_message_headers {
                    self.request(*from, (vec![*hash], BlockHash::all_zeros()));
                }
            }
            Ok(ImportResult::TipUnchanged) => {}
            Err(Error::BlockMissing(_)) => {
                // The headers don't connect to our tree. Ask for the headers leading up to
                // the first one.
                let locators = (tree.locator_hashes(tree.height()), root);

                self.request(*from, locators);
            }
            Err(Error::DuplicateBlock(_)) => {}
        }
        Some(result)
    }

    /// Called when we received an `inv` message. Asks the peer for the headers leading up
    /// to the last unknown block announced, and returns its hash.
    pub fn received_inv<T: ChainView>(
        &mut self,
        addr: PeerId,
        inv: &[Inventory],
        tree: &T,
    ) -> Option<BlockHash> {
        if inv.len() > MAX_MESSAGE_INVS {
            self.record_misbehavior(&addr, "invalid `inv` message");
            return None;
        }
        // "Headers-first is the primary method of announcement on the network. If a node
        // fell back to sending blocks by inv, it's probably for a re-org. The final block
        // hash provided should be the highest."
        let best = inv
            .iter()
            .filter_map(|i| match i {
                Inventory::Block(hash) if !tree.is_known(hash) => Some(*hash),
                _ => None,
            })
            .last()?;

        let locators = (tree.locator_hashes(tree.height()), best);
        self.request(addr, locators);

        Some(best)
    }

    /// Called when a timer expired.
    pub fn received_wake(&mut self) {
        let local_time = self.clock.local_time();
        let timeout = self.config.request_timeout;

        self.inflight.retain(|addr, req| {
            if local_time - req.sent_at >= timeout {
                log::debug!(
                    target: "p2p",
                    "{}: Request for headers up to {} timed out",
                    addr,
                    req.locators.1
                );
                false
            } else {
                true
            }
        });
    }

    /// Whether a `getheaders` request to the peer is pending.
    pub fn is_requesting(&self, addr: &PeerId) -> bool {
        self.inflight.contains_key(addr)
    }

    ///////////////////////////////////////////////////////////////////////////

    fn request(&mut self, addr: PeerId, locators: Locators) {
        // Don't request more than once from the same peer.
        if self.inflight.contains_key(&addr) {
            return;
        }
        let timeout = self.config.request_timeout;
        let req = GetHeaders {
            locators,
            sent_at: self.clock.local_time(),
        };

        self.outbox.get_headers(addr, req.locators.clone());
        self.outbox.set_timer(timeout);
        self.inflight.insert(addr, req);
    }

    fn record_misbehavior(&mut self, addr: &PeerId, reason: &'static str) {
        self.outbox.event(Event::PeerMisbehaved {
            addr: *addr,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use herald_chain::block::cache::BlockCache;
    use herald_common::bitcoin::network::message::NetworkMessage;
    use herald_test::assert_matches;
    use herald_test::block::gen;

    use crate::fsm::output::test::{events, messages_from};
    use crate::fsm::Event as FsmEvent;

    fn syncmgr() -> SyncManager<LocalTime> {
        SyncManager::new(
            Config::default(),
            fastrand::Rng::with_seed(1),
            Outbox::default(),
            LocalTime::from_secs(1_000_000),
        )
    }

    #[test]
    fn test_getheaders_empty_reply_is_sent() {
        let mut rng = fastrand::Rng::with_seed(1);
        let chain = gen::headers(gen::genesis(), 4, &mut rng);
        let tree = BlockCache::from(chain.clone());
        let mut syncmgr = syncmgr();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();
        let tip = chain.last().block_hash();

        let last =
            syncmgr.received_getheaders(&addr, (vec![tip], BlockHash::all_zeros()), &tree);

        assert_eq!(last, tip);
        assert_eq!(
            messages_from(syncmgr, &addr).collect::<Vec<_>>(),
            vec![NetworkMessage::Headers(vec![])]
        );
    }

    #[test]
    fn test_getblocks_skips_known() {
        let mut rng = fastrand::Rng::with_seed(2);
        let chain = gen::headers(gen::genesis(), 4, &mut rng);
        let tree = BlockCache::from(chain.clone());
        let mut syncmgr = syncmgr();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();
        let tip = chain.last().block_hash();

        let sent = syncmgr.received_getblocks(
            &addr,
            (vec![chain[1].block_hash()], BlockHash::all_zeros()),
            &tree,
            |h| *h == tip,
        );
        assert_eq!(sent, vec![chain[2].block_hash(), chain[3].block_hash()]);

        let sent = syncmgr.received_getblocks(
            &addr,
            (vec![chain[3].block_hash()], BlockHash::all_zeros()),
            &tree,
            |h| *h == tip,
        );
        assert!(sent.is_empty());
        assert_eq!(messages_from(syncmgr, &addr).count(), 1);
    }

    #[test]
    fn test_oversized_headers_is_misbehavior() {
        let mut rng = fastrand::Rng::with_seed(3);
        let mut tree = BlockCache::new(gen::genesis());
        let mut syncmgr = syncmgr();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();
        let headers = gen::fork(&gen::genesis(), MAX_MESSAGE_HEADERS + 1, &mut rng);

        assert!(syncmgr.received_headers(&addr, headers, &mut tree).is_none());
        assert_eq!(tree.height(), 0);
        assert_matches!(
            events(syncmgr).next(),
            Some(FsmEvent::Chain(Event::PeerMisbehaved { .. }))
        );
    }

    #[test]
    fn test_unsolicited_headers_limit() {
        let mut rng = fastrand::Rng::with_seed(4);
        let mut tree = BlockCache::new(gen::genesis());
        let mut syncmgr = syncmgr();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();

        let headers = gen::fork(&gen::genesis(), MAX_UNSOLICITED_HEADERS + 1, &mut rng);
        assert!(syncmgr
            .received_headers(&addr, headers, &mut tree)
            .is_none());

        let headers = gen::fork(&gen::genesis(), MAX_UNSOLICITED_HEADERS, &mut rng);
        assert_matches!(
            syncmgr.received_headers(&addr, headers, &mut tree),
            Some(Ok(ImportResult::TipChanged { .. }))
        );
        assert_eq!(tree.height(), MAX_UNSOLICITED_HEADERS as Height);
    }

    #[test]
    fn test_unconnecting_headers_request_ancestry() {
        let mut rng = fastrand::Rng::with_seed(5);
        let mut tree = BlockCache::new(gen::genesis());
        let mut syncmgr = syncmgr();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();

        let missing = gen::header(&gen::genesis(), &mut rng);
        let headers = gen::fork(&missing, 2, &mut rng);
        let root = headers[0].block_hash();

        assert_matches!(
            syncmgr.received_headers(&addr, headers, &mut tree),
            Some(Err(Error::BlockMissing(_)))
        );
        assert!(syncmgr.is_requesting(&addr));
        assert_matches!(
            messages_from(syncmgr, &addr).next(),
            Some(NetworkMessage::GetHeaders(msg)) if msg.stop_hash == root
        );
    }

    #[test]
    fn test_inv_requests_headers_once() {
        let mut rng = fastrand::Rng::with_seed(6);
        let tree = BlockCache::new(gen::genesis());
        let mut syncmgr = syncmgr();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();

        let a = gen::header(&gen::genesis(), &mut rng).block_hash();
        let b = gen::header(&gen::genesis(), &mut rng).block_hash();
        let genesis = gen::genesis().block_hash();

        let best = syncmgr.received_inv(
            addr,
            &[Inventory::Block(a), Inventory::Block(b), Inventory::Block(genesis)],
            &tree,
        );
        assert_eq!(best, Some(b));
        assert_eq!(syncmgr.received_inv(addr, &[Inventory::Block(a)], &tree), Some(a));

        let getheaders = messages_from(syncmgr, &addr)
            .filter(|m| matches!(m, NetworkMessage::GetHeaders(_)))
            .count();
        assert_eq!(getheaders, 1);
    }

    #[test]
    fn test_request_timeout() {
        let mut rng = fastrand::Rng::with_seed(7);
        let tree = BlockCache::new(gen::genesis());
        let clock = herald_common::block::time::RefClock::from(LocalTime::from_secs(1_000));
        let mut syncmgr = SyncManager::new(
            Config::default(),
            fastrand::Rng::with_seed(1),
            Outbox::default(),
            clock.clone(),
        );
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();
        let hash = gen::header(&gen::genesis(), &mut rng).block_hash();

        syncmgr.received_inv(addr, &[Inventory::Block(hash)], &tree);
        assert!(syncmgr.is_requesting(&addr));

        clock.elapse(LocalDuration::from_secs(REQUEST_TIMEOUT.as_secs() - 1));
        syncmgr.received_wake();
        assert!(syncmgr.is_requesting(&addr));

        clock.elapse(LocalDuration::from_secs(1));
        syncmgr.received_wake();
        assert!(!syncmgr.is_requesting(&addr));
    }
}
