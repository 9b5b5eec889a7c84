//! Library of common Bitcoin functionality shared by all herald crates.
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]
pub mod block;
pub mod collections;
pub mod network;

pub use bitcoin;
pub use bitcoin::hashes as bitcoin_hashes;
pub use nonempty;
