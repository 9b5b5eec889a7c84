//! Block announcement protocol state machine.
#![warn(missing_docs)]
use crossbeam_channel as chan;
use log::*;

pub mod announce;
pub mod event;
pub mod output;

// Sub-protocols.
mod annmgr;
mod invmgr;
mod syncmgr;


use annmgr::AnnounceManager;
use invmgr::InventoryManager;
use output::Outbox;
use syncmgr::SyncManager;

pub use annmgr::Event as AnnounceEvent;
pub use annmgr::Via;
pub use announce::Mode;
pub use invmgr::Event as InventoryEvent;
pub use syncmgr::Event as ChainEvent;
pub use syncmgr::{MAX_GETBLOCKS_INVS, MAX_MESSAGE_HEADERS};

pub use event::Event;
pub use herald_net::Link;
pub use output::Io;

use std::fmt;
use std::net;
use std::sync::Arc;

use herald_common::bitcoin::network::message::NetworkMessage;
use herald_common::bitcoin::network::message_blockdata::{
    GetBlocksMessage, GetHeadersMessage, Inventory,
};
use herald_common::block::time::{AdjustableClock, LocalDuration, LocalTime};
use herald_common::block::tree::{self, BlockTree, ImportResult};
use herald_common::block::{BlockHash, BlockHeader};
use herald_common::collections::HashMap;
use herald_common::network;

pub use herald_common::block::Height;

/// Peer-to-peer protocol version.
/// This version includes support for the `sendheaders` feature.
pub const PROTOCOL_VERSION: u32 = 70016;

/// Block locators. Consists of starting hashes and a stop hash.
type Locators = (Vec<BlockHash>, BlockHash);

/// Identifies a peer.
pub type PeerId = net::SocketAddr;

/// Disconnect reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer was disconnected for another reason.
    Other(&'static str),
}

impl From<DisconnectReason> for herald_net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::Command => write!(f, "received external command"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Peer address.
    pub addr: net::SocketAddr,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
}

/// A command or request that can be sent to the protocol.
#[derive(Clone)]
pub enum Command {
    /// Get the tip of the active chain.
    GetTip(chan::Sender<(Height, BlockHeader)>),
    /// Get connected peers.
    GetPeers(chan::Sender<Vec<Peer>>),
    /// Get the announcement mode of a peer.
    GetPeerMode(PeerId, chan::Sender<Option<Mode>>),
    /// Disconnect from a peer.
    Disconnect(PeerId),
    /// Import headers into the block tree. If the active tip changes, the new tip is
    /// announced to every connected peer.
    ImportHeaders(
        Vec<BlockHeader>,
        chan::Sender<Result<ImportResult, tree::Error>>,
    ),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetTip(_) => write!(f, "GetTip"),
            Self::GetPeers(_) => write!(f, "GetPeers"),
            Self::GetPeerMode(addr, _) => write!(f, "GetPeerMode({})", addr),
            Self::Disconnect(addr) => write!(f, "Disconnect({})", addr),
            Self::ImportHeaders(headers, _) => write!(f, "ImportHeaders({})", headers.len()),
        }
    }
}

/// Holds functions that are used to hook into or alter protocol behavior.
#[derive(Clone)]
pub struct Hooks {
    /// Called when we receive a message from a peer.
    /// If an error is returned, the message is not further processed.
    pub on_message:
        Arc<dyn Fn(PeerId, &NetworkMessage, &Outbox) -> Result<(), &'static str> + Send + Sync>,
    /// Called when a `getdata` message is received. Blocks are not stored by the state
    /// machine, so serving them is up to the embedder.
    pub on_getdata: Arc<dyn Fn(PeerId, Vec<Inventory>, &Outbox) + Send + Sync>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_message: Arc::new(|_, _, _| Ok(())),
            on_getdata: Arc::new(|_, _, _| {}),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////

/// An instance of the block announcement protocol. Parametrized over the block-tree
/// and the clock.
#[derive(Debug)]
pub struct StateMachine<T, C> {
    /// Block tree.
    tree: T,
    /// Bitcoin network we're connecting to.
    network: network::Network,
    /// Connected peers.
    peers: HashMap<PeerId, Peer>,
    /// Block announcement manager.
    annmgr: AnnounceManager,
    /// Blockchain synchronization manager.
    syncmgr: SyncManager<C>,
    /// Inventory manager.
    invmgr: InventoryManager<C>,
    /// Local clock.
    clock: C,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    outbox: Outbox,
    /// State machine event hooks.
    hooks: Hooks,
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bitcoin network we are connected to.
    pub network: network::Network,
    /// Our protocol version.
    pub protocol_version: u32,
    /// Maximum number of headers announced to a peer at once.
    pub max_blocks_to_announce: usize,
    /// Maximum number of block hashes remembered per peer.
    pub known_inventory_capacity: usize,
    /// Maximum number of headers sent in reply to `getheaders`.
    pub max_message_headers: usize,
    /// Maximum number of inventories sent in reply to `getblocks`.
    pub max_getblocks_invs: usize,
    /// How long to wait for a `getheaders` request to be fulfilled.
    pub sync_timeout: LocalDuration,
    /// How long to wait for a requested block.
    pub request_timeout: LocalDuration,
    /// State machine event hooks.
    pub hooks: Hooks,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: network::Network::default(),
            protocol_version: PROTOCOL_VERSION,
            max_blocks_to_announce: announce::MAX_BLOCKS_TO_ANNOUNCE,
            known_inventory_capacity: announce::KNOWN_INVENTORY_CAPACITY,
            max_message_headers: syncmgr::MAX_MESSAGE_HEADERS,
            max_getblocks_invs: syncmgr::MAX_GETBLOCKS_INVS,
            sync_timeout: syncmgr::REQUEST_TIMEOUT,
            request_timeout: invmgr::REQUEST_TIMEOUT,
            hooks: Hooks::default(),
        }
    }
}

impl Config {
    /// Construct a new configuration for the given network.
    pub fn from(network: network::Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }
}

impl<T: BlockTree, C: AdjustableClock> StateMachine<T, C> {
    /// Construct a new protocol instance.
    pub fn new(tree: T, clock: C, rng: fastrand::Rng, config: Config) -> Self {
        let Config {
            network,
            protocol_version,
            max_blocks_to_announce,
            known_inventory_capacity,
            max_message_headers,
            max_getblocks_invs,
            sync_timeout,
            request_timeout,
            hooks,
        } = config;

        let outbox = Outbox::new(protocol_version);
        let annmgr = AnnounceManager::new(
            annmgr::Config {
                max_blocks_to_announce,
                known_inventory_capacity,
            },
            rng.clone(),
            outbox.clone(),
        );
        let syncmgr = SyncManager::new(
            syncmgr::Config {
                max_message_headers,
                max_getblocks_invs,
                request_timeout: sync_timeout,
            },
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let invmgr =
            InventoryManager::new(request_timeout, rng.clone(), outbox.clone(), clock.clone());

        Self {
            tree,
            network,
            peers: HashMap::with_hasher(rng.into()),
            annmgr,
            syncmgr,
            invmgr,
            clock,
            outbox,
            hooks,
        }
    }

    /// Get the block tree.
    pub fn tree(&self) -> &T {
        &self.tree
    }

    /// Get the announcement mode of a connected peer.
    pub fn peer_mode(&self, addr: &PeerId) -> Option<Mode> {
        self.annmgr.peer(addr).map(|p| p.mode())
    }

    /// Get the connected peers.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values()
    }

    /// Whether a block is being fetched from a peer.
    pub fn is_fetching(&self, hash: &BlockHash) -> bool {
        self.invmgr.is_requested(hash)
    }

    /// Whether headers were requested from a peer and not yet received.
    pub fn is_syncing(&self, addr: &PeerId) -> bool {
        self.syncmgr.is_requesting(addr)
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.outbox.disconnect(addr, reason);
    }

    /// Create a draining iterator over the protocol outputs.
    pub fn drain(&mut self) -> Box<dyn Iterator<Item = output::Io> + '_> {
        Box::new(std::iter::from_fn(|| self.next()))
    }

    /// Process a user command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::GetTip(reply) => {
                let (_, header) = self.tree.tip();
                let height = self.tree.height();

                reply.send((height, header)).ok();
            }
            Command::GetPeers(reply) => {
                reply.send(self.peers.values().cloned().collect()).ok();
            }
            Command::GetPeerMode(addr, reply) => {
                reply.send(self.peer_mode(&addr)).ok();
            }
            Command::Disconnect(addr) => {
                self.disconnect(addr, DisconnectReason::Command);
            }
            Command::ImportHeaders(headers, reply) => {
                let (old, _) = self.tree.tip();
                let result = self
                    .syncmgr
                    .import_blocks(headers.into_iter(), &mut self.tree);

                if let Ok(ImportResult::TipChanged { hash, .. }) = &result {
                    self.annmgr.tip_changed(&old, hash, &self.tree);
                }
                reply.send(result).ok();
            }
        }
    }

    /// Called when a peer sent us headers, either in a `headers` or a `block` message.
    fn received_headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>) {
        let hashes = headers.iter().map(|h| h.block_hash()).collect::<Vec<_>>();
        let unknown = hashes
            .iter()
            .filter(|h| !self.tree.is_known(h))
            .copied()
            .collect::<Vec<_>>();
        let (old, _) = self.tree.tip();

        // Recorded before the import, so that the peer isn't sent back its own blocks.
        self.annmgr.mark_known(&addr, hashes.iter().copied());

        match self.syncmgr.received_headers(&addr, headers, &mut self.tree) {
            Some(Ok(result)) => {
                let fetch = unknown
                    .into_iter()
                    .filter(|h| self.tree.is_on_active_chain(h))
                    .collect::<Vec<_>>();

                self.invmgr.get_blocks(addr, fetch);
                self.annmgr
                    .received_announcements(&addr, &hashes, &self.tree);

                if let ImportResult::TipChanged { hash, .. } = result {
                    self.annmgr.tip_changed(&old, &hash, &self.tree);
                }
            }
            Some(Err(err)) => {
                debug!(target: "p2p", "{}: Failed to import headers: {}", addr, err);
            }
            None => {}
        }
    }
}

impl<T, C> Iterator for StateMachine<T, C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

impl<T: BlockTree, C: AdjustableClock> herald_net::StateMachine for StateMachine<T, C> {
    type Message = NetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);

        let genesis = self.tree.genesis().block_hash();
        if genesis != self.network.genesis_hash() {
            warn!(
                target: "p2p",
                "Block tree genesis {} doesn't match the {} genesis",
                genesis,
                self.network.as_str()
            );
        }
        let (hash, _) = self.tree.tip();

        self.outbox.event(Event::Ready {
            height: self.tree.height(),
            hash,
            time,
        });
    }

    fn message_received(&mut self, addr: &net::SocketAddr, msg: NetworkMessage) {
        let cmd = msg.cmd();
        let addr = *addr;

        if !self.peers.contains_key(&addr) {
            debug!(target: "p2p", "Received {:?} from unknown peer {}", cmd, addr);
            return;
        }
        debug!(target: "p2p", "Received {:?} from {}", cmd, addr);

        if let Err(err) = (self.hooks.on_message)(addr, &msg, &self.outbox) {
            debug!(
                target: "p2p",
                "Message {:?} from {} dropped by user hook: {}",
                cmd, addr, err
            );
            return;
        }

        match msg {
            NetworkMessage::SendHeaders => {
                self.annmgr.received_sendheaders(&addr);
            }
            NetworkMessage::GetHeaders(GetHeadersMessage {
                locator_hashes,
                stop_hash,
                ..
            }) => {
                let last =
                    self.syncmgr
                        .received_getheaders(&addr, (locator_hashes, stop_hash), &self.tree);

                self.annmgr.served_headers(&addr, &last, &self.tree);
            }
            NetworkMessage::GetBlocks(GetBlocksMessage {
                locator_hashes,
                stop_hash,
                ..
            }) => {
                let annmgr = &self.annmgr;
                let sent = self.syncmgr.received_getblocks(
                    &addr,
                    (locator_hashes, stop_hash),
                    &self.tree,
                    |hash| annmgr.knows(&addr, hash),
                );
                self.annmgr.mark_known(&addr, sent);
            }
            NetworkMessage::GetData(invs) => {
                // Nb. Serving content says nothing about the peer's view of our headers.
                self.invmgr.received_getdata(addr, &invs);
                (*self.hooks.on_getdata)(addr, invs, &self.outbox);
            }
            NetworkMessage::Inv(inventory) => {
                let hashes = inventory
                    .iter()
                    .filter_map(|i| match i {
                        Inventory::Block(hash) => Some(*hash),
                        _ => None,
                    })
                    .collect::<Vec<_>>();

                self.annmgr
                    .received_announcements(&addr, &hashes, &self.tree);

                if let Some(best) = self.syncmgr.received_inv(addr, &inventory, &self.tree) {
                    self.invmgr.get_blocks(addr, Some(best));
                }
            }
            NetworkMessage::Headers(headers) => {
                self.received_headers(addr, headers);
            }
            NetworkMessage::Block(block) => {
                self.invmgr.received_block(&addr, &block);

                if !self.tree.is_known(&block.block_hash()) {
                    self.received_headers(addr, vec![block.header]);
                }
            }
            NetworkMessage::Unknown {
                command: ref cmd, ..
            } => {
                warn!(target: "p2p", "Ignoring unknown message {:?} from {}", cmd, addr)
            }
            _ => {
                warn!(target: "p2p", "Ignoring {:?} from {}", cmd, addr);
            }
        }
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        let peer = Peer {
            addr,
            local_addr: *local_addr,
            link,
            since: self.clock.local_time(),
        };
        self.peers.insert(addr, peer);
        self.annmgr.peer_connected(addr);
        self.outbox.event(Event::PeerConnected { addr, link });
    }

    fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: herald_net::Disconnect<DisconnectReason>,
    ) {
        if self.peers.remove(addr).is_none() {
            return;
        }
        self.annmgr.peer_disconnected(addr);
        self.syncmgr.peer_disconnected(addr);
        self.invmgr.peer_disconnected(addr);
        self.outbox.event(Event::PeerDisconnected {
            addr: *addr,
            reason,
        });
    }

    fn tick(&mut self, local_time: LocalTime) {
        trace!("Received tick");

        self.clock.set(local_time);
    }

    fn timer_expired(&mut self) {
        trace!("Received wake");

        self.syncmgr.received_wake();
        self.invmgr.timer_expired();
    }
}
