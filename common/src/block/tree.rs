//! Types and functions relating to block trees.
//!
//! The [`ChainView`] trait is the read-only view of the header tree that the
//! announcement logic is built on. It answers questions about the active chain and
//! about the ancestry of any known header, including headers on stale branches.
#![warn(missing_docs)]
use std::collections::VecDeque;

use bitcoin::blockdata::block::BlockHeader;
use bitcoin::hash_types::BlockHash;

use thiserror::Error;

use crate::block::Height;
use crate::nonempty::NonEmpty;

/// An error related to the block tree.
#[derive(Debug, Error)]
pub enum Error {
    /// The block is already known.
    #[error("duplicate block {0}")]
    DuplicateBlock(BlockHash),

    /// The block's parent is unknown.
    #[error("block missing: {0}")]
    BlockMissing(BlockHash),
}

/// The outcome of a successful block header import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportResult {
    /// A new tip was found. This can happen in either of two scenarios:
    ///
    /// 1. The imported block(s) extended the active chain, or
    /// 2. The imported block(s) caused a chain re-org. In that case, `reverted` is
    ///    populated with the now stale blocks.
    ///
    TipChanged {
        /// Header of the new tip.
        header: BlockHeader,
        /// Hash of the new tip.
        hash: BlockHash,
        /// Height of the new tip.
        height: Height,
        /// Blocks that were removed from the active chain, highest first.
        reverted: Vec<(Height, BlockHeader)>,
        /// Blocks that were added to the active chain, lowest first.
        connected: NonEmpty<(Height, BlockHeader)>,
    },
    /// The block headers were imported successfully, but our best block hasn't changed.
    /// This will happen if we imported a duplicate or stale block.
    TipUnchanged,
}

/// Read-only view of the block header tree.
///
/// Implementors provide lookups; the ancestry queries are derived from them. Queries
/// that take a hash the tree doesn't know, or an "ancestor" that isn't one, are
/// contract violations and panic.
pub trait ChainView {
    /// Get any known header by hash, whether or not it is on the active chain.
    fn get_header(&self, hash: &BlockHash) -> Option<(Height, &BlockHeader)>;
    /// Get a block of the active chain by height.
    fn get_block_by_height(&self, height: Height) -> Option<&BlockHeader>;
    /// Get the tip of the active chain.
    fn tip(&self) -> (BlockHash, BlockHeader);
    /// Return the height of the active chain.
    fn height(&self) -> Height;
    /// Check whether a block hash is part of the active chain.
    fn is_on_active_chain(&self, hash: &BlockHash) -> bool;

    /// Check whether a block hash is known, on any branch.
    fn is_known(&self, hash: &BlockHash) -> bool {
        self.get_header(hash).is_some()
    }

    /// Get the height of any known block.
    fn block_height(&self, hash: &BlockHash) -> Option<Height> {
        self.get_header(hash).map(|(height, _)| height)
    }

    /// Return the genesis block header.
    fn genesis(&self) -> &BlockHeader {
        self.get_block_by_height(0)
            .expect("the genesis block is always present")
    }

    /// Get the ancestor of a known block at the given height. Returns `None` if the block
    /// is unknown or lower than the requested height.
    fn ancestor_at(&self, hash: &BlockHash, height: Height) -> Option<BlockHeader> {
        let (mut current, header) = self.get_header(hash)?;
        let mut header = *header;

        if height > current {
            return None;
        }
        loop {
            // Once we reach the active chain, we can look the ancestor up directly.
            if self.is_on_active_chain(&header.block_hash()) {
                return self.get_block_by_height(height).copied();
            }
            if current == height {
                return Some(header);
            }
            let (h, parent) = self.get_header(&header.prev_blockhash)?;

            current = h;
            header = *parent;
        }
    }

    /// Check whether `ancestor` is an ancestor of `of`. A block is its own ancestor.
    fn is_ancestor(&self, ancestor: &BlockHash, of: &BlockHash) -> bool {
        self.block_height(ancestor)
            .and_then(|height| self.ancestor_at(of, height))
            .map_or(false, |header| header.block_hash() == *ancestor)
    }

    /// Return the most recent common ancestor of two known blocks.
    ///
    /// *Panics* if either block is unknown, or if they don't share a genesis.
    fn fork_point(&self, a: &BlockHash, b: &BlockHash) -> BlockHash {
        let ha = self
            .block_height(a)
            .expect("ChainView::fork_point: first block must be known");
        let hb = self
            .block_height(b)
            .expect("ChainView::fork_point: second block must be known");
        let height = Height::min(ha, hb);

        let mut x = self.ancestor_at(a, height).expect("ancestry is known");
        let mut y = self.ancestor_at(b, height).expect("ancestry is known");

        while x.block_hash() != y.block_hash() {
            x = *self
                .get_header(&x.prev_blockhash)
                .expect("ChainView::fork_point: blocks must share a genesis")
                .1;
            y = *self
                .get_header(&y.prev_blockhash)
                .expect("ChainView::fork_point: blocks must share a genesis")
                .1;
        }
        x.block_hash()
    }

    /// Return the headers strictly after `ancestor`, up to and including `tip`, ordered
    /// from ancestor to descendant. Returns an empty list if `ancestor == tip`.
    ///
    /// *Panics* if `ancestor` is not an ancestor of `tip`.
    fn ancestors_since(&self, ancestor: &BlockHash, tip: &BlockHash) -> Vec<BlockHeader> {
        let ancestor_height = self
            .block_height(ancestor)
            .expect("ChainView::ancestors_since: ancestor must be known");
        let (mut height, header) = self
            .get_header(tip)
            .expect("ChainView::ancestors_since: tip must be known");
        let mut header = *header;

        assert!(
            ancestor_height <= height,
            "ChainView::ancestors_since: ancestor {} is higher than tip {}",
            ancestor,
            tip
        );
        let mut headers = VecDeque::with_capacity((height - ancestor_height) as usize);

        while height > ancestor_height {
            headers.push_front(header);

            let (h, parent) = self
                .get_header(&header.prev_blockhash)
                .expect("ChainView::ancestors_since: the ancestry of a known block is known");
            height = h;
            header = *parent;
        }
        assert_eq!(
            header.block_hash(),
            *ancestor,
            "ChainView::ancestors_since: {} is not an ancestor of {}",
            ancestor,
            tip
        );
        headers.into()
    }

    /// Resolve the best common point between a peer's locator and the chain ending at `tip`:
    /// the first locator hash that is an ancestor of `tip`, or genesis if there is none.
    fn common_ancestor(&self, locator: &[BlockHash], tip: &BlockHash) -> BlockHash {
        locator
            .iter()
            .find(|hash| self.is_ancestor(hash, tip))
            .copied()
            .unwrap_or_else(|| self.genesis().block_hash())
    }

    /// Return headers of the active chain after the first known hash in the locators list,
    /// and until the stop hash is reached.
    ///
    /// This function will never return more than `max_headers`.
    ///
    /// * When no locators are provided, the stop hash is treated as a request for that header
    ///   alone.
    /// * When locators *are* provided, but none of them are on the active chain, it is
    ///   equivalent to having the genesis hash as locator.
    ///
    fn locate_headers(
        &self,
        locators: &[BlockHash],
        stop_hash: BlockHash,
        max_headers: usize,
    ) -> Vec<BlockHeader> {
        if locators.is_empty() {
            if self.is_on_active_chain(&stop_hash) {
                if let Some((_, header)) = self.get_header(&stop_hash) {
                    return vec![*header];
                }
            }
            return vec![];
        }
        let (tip, _) = self.tip();
        let fork = self.common_ancestor(locators, &tip);
        let start = self.block_height(&fork).unwrap_or_default() + 1;

        let stop = if self.is_on_active_chain(&stop_hash) {
            self.block_height(&stop_hash).unwrap_or_else(|| self.height())
        } else {
            self.height()
        };
        let stop = Height::min(start + max_headers as Height, stop + 1);

        (start..stop)
            .filter_map(|height| self.get_block_by_height(height).copied())
            .collect()
    }

    /// Get the locator hashes for the active chain, starting at the given height.
    fn locator_hashes(&self, from: Height) -> Vec<BlockHash> {
        crate::block::locators_indexes(from)
            .into_iter()
            .filter_map(|height| self.get_block_by_height(height))
            .map(|header| header.block_hash())
            .collect()
    }
}

/// A representation of all known blocks that keeps track of the longest chain.
pub trait BlockTree: ChainView {
    /// Import a chain of block headers into the block tree. The headers don't have to
    /// extend the active chain, but must connect to a known block.
    fn import_blocks<I: Iterator<Item = BlockHeader>>(
        &mut self,
        chain: I,
    ) -> Result<ImportResult, Error>;
}
