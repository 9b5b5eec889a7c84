//! Herald's block announcement library.
//!
//! The `p2p` crate decides how connected peers are told about new blocks. The core of
//! it is the [announce](crate::fsm::announce) module: a per-peer state machine and a
//! pure decision function that, given a change of the active tip, returns either a
//! single `inv`, a list of `headers`, or nothing.
//!
//! Around it, the [fsm](crate::fsm) module implements the protocol state machine,
//! which is made of the following sub-protocols:
//!
//! * `AnnounceManager`: owns the announcement state of every peer, and fans out tip changes
//! * `SyncManager`: serves `getheaders` and `getblocks`, and imports headers from peers
//! * `InventoryManager`: fetches announced blocks, never twice at a time
//!
//! The protocol implementation is *I/O-free*. The core logic is implemented as a state
//! machine with *inputs* and *outputs* and does not perform any network I/O: inputs are
//! fed through the [`herald_net::StateMachine`] trait, and outputs are drained through
//! its `Iterator` implementation.
//!
//! The reason for this is to keep the protocol code easy to read and simple to test.
//! Not having I/O minimizes the possible error states and error-handling code in the
//! protocol, and allows for a fully *deterministic* protocol. This means failing tests
//! can always be reproduced.
//!
//! To illustrate the above, lets trace the behavior of the system when a peer that
//! asked for `headers` is told about a new block:
//!
//! 1. The reactor decodes a `NetworkMessage::Headers` message from another peer and
//!    calls `StateMachine::message_received`.
//! 2. The `SyncManager` imports the header into the block tree, and the active tip
//!    changes.
//! 3. The `AnnounceManager` runs the announcement decision for every connected peer, and
//!    pushes a `headers` message with the new header to the outbox of the first peer.
//! 4. The reactor drains the outbox, encodes the message and writes it to the socket
//!    of that peer.
//!
//! For embedders that prefer threads to a single state machine, the
//! [service](crate::service) module runs one session per peer, each on its own thread.
//!
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]
#![allow(clippy::single_match)]
#![deny(missing_docs, unsafe_code)]
pub mod error;
pub mod fsm;
pub mod service;

pub use herald_common::bitcoin;

pub use error::Error;
pub use fsm::PeerId;
