//! Block header tree used to track the active chain and its stale branches.
#[allow(clippy::len_without_is_empty)]
#[deny(
    unsafe_code,
    missing_debug_implementations,
    missing_copy_implementations
)]
pub mod block;

pub use block::cache::BlockCache;
