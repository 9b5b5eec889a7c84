//! Herald decides how a Bitcoin full node tells its peers about new blocks.
//!
//! The project is broken down into the following crates:
//!
//! * [`p2p`]: the announcement state machine and peer session logic
//! * [`chain`]: the in-memory header tree and fork selection
//! * [`common`]: the chain view traits and types shared by all crates
//! * [`net`]: time and state-machine output types
//!
//! The [`p2p`] crate is the place to start: its `fsm::announce` module holds the
//! per-peer state and the decision engine.

#[cfg(feature = "herald-chain")]
pub use herald_chain as chain;
#[cfg(feature = "herald-common")]
pub use herald_common as common;
pub use herald_net as net;
#[cfg(feature = "herald-p2p")]
pub use herald_p2p as p2p;
