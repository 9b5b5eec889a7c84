//! Threaded announcement service.
//!
//! Runs one session per peer, each on its own thread. A session exclusively owns the
//! announcement state of its peer; the only value shared between threads is the block
//! tree, and the [`Tip`] published after every import.
//!
//! Every change of the active tip is sent to every session, in order. A session that
//! falls behind may find several tip changes queued up: these are folded into a single
//! decision against the latest tip, which covers all the blocks in between.
//!
use std::sync::{Arc, RwLock};
use std::thread;

use crossbeam_channel as chan;
use log::*;

use herald_common::bitcoin::network::message::NetworkMessage;
use herald_common::bitcoin::network::message_blockdata::{GetHeadersMessage, Inventory};
use herald_common::block::tree::{BlockTree, ChainView, ImportResult};
use herald_common::block::{BlockHash, BlockHeader, Height};
use herald_common::collections::HashMap;

use crate::error::Error;
use crate::fsm::announce::{self, Mode, PeerState};
use crate::fsm::{self, PeerId};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of headers announced to a peer at once.
    pub max_blocks_to_announce: usize,
    /// Maximum number of block hashes remembered per peer.
    pub known_inventory_capacity: usize,
    /// Maximum number of headers sent in reply to `getheaders`.
    pub max_message_headers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_blocks_to_announce: announce::MAX_BLOCKS_TO_ANNOUNCE,
            known_inventory_capacity: announce::KNOWN_INVENTORY_CAPACITY,
            max_message_headers: fsm::MAX_MESSAGE_HEADERS,
        }
    }
}

/// An immutable snapshot of the active tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipSnapshot {
    /// Tip hash.
    pub hash: BlockHash,
    /// Tip height.
    pub height: Height,
    /// Tip header.
    pub header: BlockHeader,
}

impl TipSnapshot {
    fn of<T: ChainView>(tree: &T) -> Self {
        let (hash, header) = tree.tip();

        Self {
            hash,
            height: tree.height(),
            header,
        }
    }
}

/// Handle on the published active tip. Readers always see a complete snapshot.
#[derive(Debug, Clone)]
pub struct Tip(Arc<RwLock<Arc<TipSnapshot>>>);

impl Tip {
    fn new(snapshot: TipSnapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(snapshot))))
    }

    /// Get the current tip.
    pub fn get(&self) -> Result<Arc<TipSnapshot>, Error> {
        self.0
            .read()
            .map(|tip| tip.clone())
            .map_err(|_| Error::Poisoned("tip"))
    }

    fn set(&self, snapshot: TipSnapshot) -> Result<(), Error> {
        let mut tip = self.0.write().map_err(|_| Error::Poisoned("tip"))?;
        *tip = Arc::new(snapshot);

        Ok(())
    }
}

/// Input to a peer session.
#[derive(Debug, Clone)]
pub enum Input {
    /// The active tip changed.
    Tip {
        /// Previous tip.
        old: BlockHash,
        /// New tip.
        new: BlockHash,
    },
    /// A message was received from the peer.
    Message(NetworkMessage),
    /// The peer disconnected.
    Shutdown,
}

/// Handle to a running peer session.
#[derive(Debug)]
pub struct SessionHandle {
    /// Peer address.
    pub addr: PeerId,
    /// Messages to write to the peer, in order.
    pub outbound: chan::Receiver<NetworkMessage>,

    inputs: chan::Sender<Input>,
    thread: thread::JoinHandle<Result<PeerState, Error>>,
}

impl SessionHandle {
    /// Pass a message received from the peer to the session.
    pub fn received(&self, msg: NetworkMessage) -> Result<(), Error> {
        self.inputs.send(Input::Message(msg))?;

        Ok(())
    }

    /// Stop the session and wait for it to finish. Returns the final announcement state.
    pub fn shutdown(self) -> Result<PeerState, Error> {
        // The session may already be gone, if its broadcaster shut it down.
        self.inputs.send(Input::Shutdown).ok();
        self.thread.join().map_err(|_| Error::Panicked)?
    }
}

/// Publishes tip changes to peer sessions.
#[derive(Debug)]
pub struct Broadcaster<T> {
    /// Service configuration.
    pub config: Config,

    tree: Arc<RwLock<T>>,
    tip: Tip,
    sessions: HashMap<PeerId, chan::Sender<Input>>,
    rng: fastrand::Rng,
}

impl<T: BlockTree + Send + Sync + 'static> Broadcaster<T> {
    /// Create a new broadcaster over the given block tree.
    pub fn new(tree: T, config: Config, rng: fastrand::Rng) -> Self {
        let tip = Tip::new(TipSnapshot::of(&tree));

        Self {
            config,
            tree: Arc::new(RwLock::new(tree)),
            tip,
            sessions: HashMap::with_hasher(rng.clone().into()),
            rng,
        }
    }

    /// Get a handle on the published tip.
    pub fn tip(&self) -> Tip {
        self.tip.clone()
    }

    /// Get the shared block tree.
    pub fn tree(&self) -> Arc<RwLock<T>> {
        self.tree.clone()
    }

    /// Start a session for a newly connected peer.
    pub fn connect(&mut self, addr: PeerId) -> Result<SessionHandle, Error> {
        let (inputs, receiver) = chan::unbounded();
        let (sender, outbound) = chan::unbounded();
        let session = Session {
            addr,
            state: PeerState::new(self.config.known_inventory_capacity, self.rng.clone()),
            tree: self.tree.clone(),
            config: self.config.clone(),
            inputs: receiver,
            outbound: sender,
        };
        let thread = thread::Builder::new()
            .name(format!("session#{}", addr))
            .spawn(move || session.run())?;

        if let Some(previous) = self.sessions.insert(addr, inputs.clone()) {
            previous.send(Input::Shutdown).ok();
        }
        debug!(target: "p2p", "{}: Session started", addr);

        Ok(SessionHandle {
            addr,
            outbound,
            inputs,
            thread,
        })
    }

    /// Stop the session of a disconnected peer. Its announcement state is dropped.
    pub fn disconnect(&mut self, addr: &PeerId) {
        if let Some(session) = self.sessions.remove(addr) {
            session.send(Input::Shutdown).ok();
        }
    }

    /// Import headers into the block tree. If the active tip changes, the new tip is
    /// published and sent to every session.
    pub fn import(&mut self, headers: Vec<BlockHeader>) -> Result<ImportResult, Error> {
        let (old, result, snapshot) = {
            let mut tree = self.tree.write().map_err(|_| Error::Poisoned("tree"))?;
            let (old, _) = tree.tip();
            let result = tree.import_blocks(headers.into_iter())?;

            (old, result, TipSnapshot::of(&*tree))
        };

        if let ImportResult::TipChanged { hash, height, .. } = &result {
            info!(target: "p2p", "Chain tip updated to {} at height {}", hash, height);

            self.tip.set(snapshot)?;
            self.sessions.retain(|addr, session| {
                let sent = session.send(Input::Tip { old, new: *hash }).is_ok();
                if !sent {
                    debug!(target: "p2p", "{}: Session is gone", addr);
                }
                sent
            });
        }
        Ok(result)
    }
}

/// A peer session. Owns the peer's announcement state.
struct Session<T> {
    addr: PeerId,
    state: PeerState,
    tree: Arc<RwLock<T>>,
    config: Config,
    inputs: chan::Receiver<Input>,
    outbound: chan::Sender<NetworkMessage>,
}

impl<T: ChainView> Session<T> {
    fn run(mut self) -> Result<PeerState, Error> {
        let mut pending = None;

        loop {
            let input = match pending.take() {
                Some(input) => input,
                // All senders gone means the service is shutting down.
                None => match self.inputs.recv() {
                    Ok(input) => input,
                    Err(_) => break,
                },
            };

            match input {
                Input::Tip { old, mut new } => {
                    // Fold the queued tip changes into one.
                    while let Ok(next) = self.inputs.try_recv() {
                        match next {
                            Input::Tip { new: latest, .. } => new = latest,
                            other => {
                                pending = Some(other);
                                break;
                            }
                        }
                    }
                    self.tip_changed(&old, &new)?;
                }
                Input::Message(msg) => self.received(msg)?,
                Input::Shutdown => break,
            }
        }
        debug!(target: "p2p", "{}: Session stopped ({})", self.addr, self.state.mode());

        Ok(self.state)
    }

    fn tip_changed(&mut self, old: &BlockHash, new: &BlockHash) -> Result<(), Error> {
        let tree = self.tree.read().map_err(|_| Error::Poisoned("tree"))?;
        let decision = announce::decide(
            old,
            new,
            &self.state,
            &*tree,
            self.config.max_blocks_to_announce,
        );
        let before = self.state.mode();

        for msg in decision.messages() {
            debug!(target: "p2p", "{}: Sending {:?}", self.addr, msg.cmd());
            self.outbound.send(msg)?;
        }
        self.state.apply(&decision);

        if before != Mode::HeadersSuspended && self.state.mode() == Mode::HeadersSuspended {
            info!(target: "p2p", "{}: Headers announcements suspended at {}", self.addr, new);
        }
        Ok(())
    }

    fn received(&mut self, msg: NetworkMessage) -> Result<(), Error> {
        let tree = self.tree.read().map_err(|_| Error::Poisoned("tree"))?;

        match msg {
            NetworkMessage::SendHeaders => {
                if self.state.enable_headers() {
                    info!(target: "p2p", "{}: Peer requested headers announcements", self.addr);
                }
            }
            NetworkMessage::GetHeaders(GetHeadersMessage {
                locator_hashes,
                stop_hash,
                ..
            }) => {
                let headers = tree.locate_headers(
                    &locator_hashes,
                    stop_hash,
                    self.config.max_message_headers,
                );
                let last = headers
                    .last()
                    .map(|h| h.block_hash())
                    .unwrap_or_else(|| tree.tip().0);

                self.outbound.send(NetworkMessage::Headers(headers))?;

                if self.state.served_headers(&last, &*tree) {
                    info!(target: "p2p", "{}: Headers announcements resumed", self.addr);
                }
            }
            NetworkMessage::Inv(inv) => {
                for i in inv {
                    if let Inventory::Block(hash) = i {
                        if self.state.received_announcement(&hash, &*tree) {
                            info!(target: "p2p", "{}: Headers announcements resumed", self.addr);
                        }
                    }
                }
            }
            NetworkMessage::Headers(headers) => {
                for header in headers {
                    if self.state.received_announcement(&header.block_hash(), &*tree) {
                        info!(target: "p2p", "{}: Headers announcements resumed", self.addr);
                    }
                }
            }
            other => {
                debug!(target: "p2p", "{}: Ignoring {:?}", self.addr, other.cmd());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time;

    use herald_chain::block::cache::BlockCache;
    use herald_common::bitcoin_hashes::Hash as _;
    use herald_test::block::gen;

    const TIMEOUT: time::Duration = time::Duration::from_secs(3);

    fn broadcaster() -> Broadcaster<BlockCache> {
        Broadcaster::new(
            BlockCache::new(gen::genesis()),
            Config::default(),
            fastrand::Rng::with_seed(1),
        )
    }

    #[test]
    fn test_one_announcement_per_tip_in_order() {
        let mut rng = fastrand::Rng::with_seed(1);
        let mut service = broadcaster();
        let alice = service.connect(([8, 8, 8, 8], 8333).into()).unwrap();
        let bob = service.connect(([9, 9, 9, 9], 8333).into()).unwrap();

        bob.received(NetworkMessage::SendHeaders).unwrap();

        let mut parent = gen::genesis();
        for _ in 0..4 {
            let header = gen::header(&parent, &mut rng);
            service.import(vec![header]).unwrap();

            assert_eq!(
                alice.outbound.recv_timeout(TIMEOUT).unwrap(),
                NetworkMessage::Inv(vec![Inventory::Block(header.block_hash())])
            );
            assert_eq!(
                bob.outbound.recv_timeout(TIMEOUT).unwrap(),
                NetworkMessage::Headers(vec![header])
            );
            parent = header;
        }
        assert_eq!(service.tip().get().unwrap().header, parent);
        assert_eq!(service.tip().get().unwrap().height, 4);

        let alice = alice.shutdown().unwrap();
        let bob = bob.shutdown().unwrap();

        assert_eq!(alice.mode(), Mode::InvOnly);
        assert_eq!(bob.mode(), Mode::HeadersActive);
        assert_eq!(bob.last_announced(), Some(&parent));
    }

    #[test]
    fn test_queued_tips_are_folded() {
        let mut rng = fastrand::Rng::with_seed(2);
        let mut service = broadcaster();
        let alice = service.connect(([8, 8, 8, 8], 8333).into()).unwrap();

        alice.received(NetworkMessage::SendHeaders).unwrap();

        let chain = gen::fork(&gen::genesis(), 5, &mut rng);
        for header in &chain {
            service.import(vec![*header]).unwrap();
        }
        let outbound = alice.outbound.clone();
        let state = alice.shutdown().unwrap();

        // However the tips were batched, the headers sent are the whole chain, in order.
        let sent = outbound
            .try_iter()
            .flat_map(|msg| match msg {
                NetworkMessage::Headers(headers) => headers,
                other => panic!("unexpected message {:?}", other),
            })
            .collect::<Vec<_>>();

        assert_eq!(sent, chain);
        assert_eq!(state.last_announced(), chain.last());
    }

    #[test]
    fn test_getheaders_resumes_session() {
        let mut rng = fastrand::Rng::with_seed(3);
        let mut service = broadcaster();
        let alice = service.connect(([8, 8, 8, 8], 8333).into()).unwrap();

        alice.received(NetworkMessage::SendHeaders).unwrap();

        let chain = gen::fork(&gen::genesis(), announce::MAX_BLOCKS_TO_ANNOUNCE + 2, &mut rng);
        let tip = chain.last().unwrap().block_hash();
        service.import(chain.clone()).unwrap();

        assert_eq!(
            alice.outbound.recv_timeout(TIMEOUT).unwrap(),
            NetworkMessage::Inv(vec![Inventory::Block(tip)])
        );

        alice
            .received(NetworkMessage::GetHeaders(GetHeadersMessage {
                version: fsm::PROTOCOL_VERSION,
                locator_hashes: vec![gen::genesis().block_hash()],
                stop_hash: BlockHash::all_zeros(),
            }))
            .unwrap();
        assert_eq!(
            alice.outbound.recv_timeout(TIMEOUT).unwrap(),
            NetworkMessage::Headers(chain.clone())
        );

        let next = gen::header(chain.last().unwrap(), &mut rng);
        service.import(vec![next]).unwrap();

        assert_eq!(
            alice.outbound.recv_timeout(TIMEOUT).unwrap(),
            NetworkMessage::Headers(vec![next])
        );
        assert_eq!(alice.shutdown().unwrap().mode(), Mode::HeadersActive);
    }

    #[test]
    fn test_disconnected_session_is_dropped() {
        let mut rng = fastrand::Rng::with_seed(4);
        let mut service = broadcaster();
        let addr: PeerId = ([8, 8, 8, 8], 8333).into();
        let alice = service.connect(addr).unwrap();

        service.disconnect(&addr);
        let outbound = alice.outbound.clone();
        alice.shutdown().unwrap();

        service
            .import(vec![gen::header(&gen::genesis(), &mut rng)])
            .unwrap();
        assert!(outbound.try_recv().is_err());
    }
}
