//! Block and blockchain related functionality.
pub mod cache;

pub use herald_common::bitcoin::blockdata::block::{Block, BlockHeader};
pub use herald_common::bitcoin::hash_types::BlockHash;
pub use herald_common::block::tree::*;
