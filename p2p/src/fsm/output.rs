//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
use log::*;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net;
use std::rc::Rc;

use herald_common::bitcoin::network::message::NetworkMessage;
use herald_common::bitcoin::network::message_blockdata::{
    GetBlocksMessage, GetHeadersMessage, Inventory,
};
use herald_common::block::time::LocalDuration;
use herald_common::block::{BlockHash, BlockHeader};

use crate::fsm::{Event, PeerId};

use super::Locators;

/// Output of a state transition of the `Protocol` state machine.
pub type Io = herald_net::Io<NetworkMessage, Event, super::DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Holds protocol outputs and pending I/O.
///
/// Cloning an outbox yields a handle onto the same queue, so that every sub-protocol
/// pushes to it in the order things happen.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// Protocol version.
    version: u32,
    /// Output queue.
    outbound: Rc<RefCell<VecDeque<Io>>>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(super::PROTOCOL_VERSION)
    }
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.borrow_mut().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            outbound: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.borrow_mut().push_back(output);
    }

    /// Number of pending outputs.
    pub fn len(&self) -> usize {
        self.outbound.borrow().len()
    }

    /// Whether there are no pending outputs.
    pub fn is_empty(&self) -> bool {
        self.outbound.borrow().is_empty()
    }

    /// Push a message to the channel.
    pub fn message(&self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "p2p", "Sending {:?} to {}", payload.cmd(), addr);

        self.push(Io::Write(addr, payload));
        self
    }

    /// Push an event to the channel.
    pub fn event<E: std::fmt::Display + Into<Event>>(&self, event: E) {
        info!(target: "p2p", "{event}");

        self.push(Io::Event(event.into()));
    }

    /// Disconnect from a peer.
    pub fn disconnect(&self, addr: net::SocketAddr, reason: super::DisconnectReason) {
        debug!(target: "p2p", "Disconnecting from {addr}: {reason}");

        self.push(Io::Disconnect(addr, reason));
    }

    /// Set a timer expiring after the given duration.
    pub fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }

    /// Get headers from a peer.
    pub fn get_headers(&self, addr: PeerId, (locator_hashes, stop_hash): Locators) {
        let msg = NetworkMessage::GetHeaders(GetHeadersMessage {
            version: self.version,
            // Starting hashes, highest heights first.
            locator_hashes,
            // Using the zero hash means *fetch as many blocks as possible*.
            stop_hash,
        });

        self.message(addr, msg);
    }

    /// Get block inventories from a peer.
    pub fn get_blocks(&self, addr: PeerId, (locator_hashes, stop_hash): Locators) {
        let msg = NetworkMessage::GetBlocks(GetBlocksMessage {
            version: self.version,
            locator_hashes,
            stop_hash,
        });

        self.message(addr, msg);
    }

    /// Send headers to a peer.
    pub fn headers(&self, addr: PeerId, headers: Vec<BlockHeader>) {
        self.message(addr, NetworkMessage::Headers(headers));
    }

    /// Sends an `inv` message to a peer.
    pub fn inv(&self, addr: PeerId, inventories: Vec<Inventory>) {
        self.message(addr, NetworkMessage::Inv(inventories));
    }

    /// Sends a `getdata` message to a peer.
    pub fn get_data(&self, addr: PeerId, inventories: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(inventories));
    }

    /// Request a single block from a peer.
    pub fn get_block(&self, addr: PeerId, hash: BlockHash) {
        self.get_data(addr, vec![Inventory::Block(hash)]);
    }

    /// Send a `sendheaders` message.
    pub fn send_headers(&self, addr: PeerId) -> &Self {
        self.message(addr, NetworkMessage::SendHeaders);
        self
    }
}
