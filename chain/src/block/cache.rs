//! In-memory block tree.
//!
//! *Handles header import and chain selection. Headers are assumed to be valid.*
//!
#![warn(missing_docs)]

#[cfg(test)]
pub mod test;

use std::collections::{HashMap, VecDeque};

use herald_common::bitcoin::blockdata::block::BlockHeader;
use herald_common::bitcoin::hash_types::BlockHash;
use herald_common::bitcoin::util::uint::Uint256;
use herald_common::bitcoin::util::BitArray;

use herald_common::block::tree::{BlockTree, ChainView, Error, ImportResult};
use herald_common::block::Height;
use herald_common::nonempty::NonEmpty;

/// A block that is being stored by the block cache.
#[derive(Debug, Clone, Copy)]
struct CachedBlock {
    pub height: Height,
    pub hash: BlockHash,
    pub header: BlockHeader,
}

/// A chain candidate, forking off the active chain.
#[derive(Debug)]
struct Candidate {
    tip: BlockHash,
    headers: Vec<BlockHeader>,
    fork_height: Height,
}

/// An in-memory implementation of [`BlockTree`].
///
/// Keeps the active chain indexed by height, and every header that isn't on the active
/// chain, but connects to it, in a separate map. Switches to the branch with the most
/// work; on a tie, the first branch seen wins.
///
#[derive(Debug, Clone)]
pub struct BlockCache {
    chain: NonEmpty<CachedBlock>,
    headers: HashMap<BlockHash, Height>,
    stale: HashMap<BlockHash, (Height, BlockHeader)>,
}

impl BlockCache {
    /// Create a new `BlockCache` containing only the given genesis header.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.block_hash();
        let chain = NonEmpty::new(CachedBlock {
            height: 0,
            hash,
            header: genesis,
        });
        let mut headers = HashMap::new();
        headers.insert(hash, 0);

        Self {
            chain,
            headers,
            stale: HashMap::new(),
        }
    }

    /// Create a new `BlockCache` from a chain of headers, starting with genesis.
    ///
    /// *Panics* if the headers don't form a chain.
    ///
    pub fn from(chain: NonEmpty<BlockHeader>) -> Self {
        let mut cache = Self::new(chain.head);

        for (header, height) in chain.tail.into_iter().zip(1..) {
            cache.extend_chain(height, header.block_hash(), header);
        }
        cache
    }

    /// Iterate over the active chain, starting from genesis.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Height, &BlockHeader)> {
        std::iter::once(&self.chain.head)
            .chain(self.chain.tail.iter())
            .map(|blk| (blk.height, &blk.header))
    }

    /// Number of known headers that are not on the active chain.
    pub fn stale_len(&self) -> usize {
        self.stale.len()
    }

    /// Import a block into the tree. This function may trigger a chain re-org.
    fn import_block(&mut self, header: BlockHeader) -> Result<(), Error> {
        let hash = header.block_hash();
        let tip = *self.chain.last();

        // Block extends the active chain.
        if header.prev_blockhash == tip.hash {
            self.extend_chain(tip.height + 1, hash, header);

            return Ok(());
        }
        if self.is_known(&hash) {
            return Err(Error::DuplicateBlock(hash));
        }
        let parent = self
            .get_header(&header.prev_blockhash)
            .map(|(height, _)| height)
            .ok_or(Error::BlockMissing(header.prev_blockhash))?;

        self.stale.insert(hash, (parent + 1, header));

        // Only the new block can produce a better branch: any other candidate was
        // already considered when its own tip was imported.
        let branch = self.fork(&hash);
        let candidate_work = work(branch.headers.iter());
        let lost_work = work(self.chain_suffix(branch.fork_height).iter().map(|b| &b.header));

        if candidate_work > lost_work {
            log::debug!(
                target: "chain",
                "Switching to branch {} at height {} (fork height = {})",
                branch.tip,
                branch.fork_height + branch.headers.len() as Height,
                branch.fork_height
            );
            self.switch_to_fork(&branch);
        }
        Ok(())
    }

    /// Find the branch starting from the active chain and ending at the given tip.
    ///
    /// # Errors
    ///
    /// Panics if the provided tip is on the active chain, or isn't connected to it.
    ///
    fn fork(&self, tip: &BlockHash) -> Candidate {
        let tip = *tip;

        let mut headers = VecDeque::new();
        let mut cursor = tip;

        assert!(
            !self.headers.contains_key(&tip),
            "BlockCache::fork: the provided tip must not be on the active chain"
        );

        while let Some((_, header)) = self.stale.get(&cursor) {
            cursor = header.prev_blockhash;
            headers.push_front(*header);
        }
        let fork_height = *self
            .headers
            .get(&cursor)
            .expect("BlockCache::fork: stale blocks are connected to the active chain");

        Candidate {
            tip,
            fork_height,
            headers: headers.into(),
        }
    }

    /// Rollback active chain to the given height. Returns the list of rolled-back headers.
    fn rollback(&mut self, height: Height) -> Vec<(Height, BlockHeader)> {
        let mut stale = Vec::new();

        for block in self.chain.tail.drain(height as usize..) {
            stale.push((block.height, block.header));

            self.headers.remove(&block.hash);
            self.stale.insert(block.hash, (block.height, block.header));
        }
        stale
    }

    /// Activate a fork candidate. Returns the list of rolled-back (stale) headers.
    fn switch_to_fork(&mut self, branch: &Candidate) -> Vec<(Height, BlockHeader)> {
        let stale = self.rollback(branch.fork_height);

        for (i, header) in branch.headers.iter().enumerate() {
            self.extend_chain(
                branch.fork_height + i as Height + 1,
                header.block_hash(),
                *header,
            );
        }
        stale
    }

    /// Extend the active chain with a block.
    fn extend_chain(&mut self, height: Height, hash: BlockHash, header: BlockHeader) {
        assert_eq!(header.prev_blockhash, self.chain.last().hash);

        self.headers.insert(hash, height);
        self.stale.remove(&hash);
        self.chain.push(CachedBlock {
            height,
            hash,
            header,
        });
    }

    /// Get the blocks starting from the given height.
    fn chain_suffix(&self, height: Height) -> &[CachedBlock] {
        &self.chain.tail[height as usize..]
    }
}

/// Total work included in a sequence of headers.
fn work<'a>(headers: impl Iterator<Item = &'a BlockHeader>) -> Uint256 {
    headers.fold(Uint256::zero(), |acc, header| acc + header.work())
}

impl ChainView for BlockCache {
    fn get_header(&self, hash: &BlockHash) -> Option<(Height, &BlockHeader)> {
        if let Some(height) = self.headers.get(hash) {
            return self
                .chain
                .get(*height as usize)
                .map(|blk| (blk.height, &blk.header));
        }
        self.stale.get(hash).map(|(height, header)| (*height, header))
    }

    fn get_block_by_height(&self, height: Height) -> Option<&BlockHeader> {
        self.chain.get(height as usize).map(|b| &b.header)
    }

    fn tip(&self) -> (BlockHash, BlockHeader) {
        (self.chain.last().hash, self.chain.last().header)
    }

    fn height(&self) -> Height {
        self.chain.tail.len() as Height
    }

    fn is_on_active_chain(&self, hash: &BlockHash) -> bool {
        self.headers.contains_key(hash)
    }

    fn is_known(&self, hash: &BlockHash) -> bool {
        self.headers.contains_key(hash) || self.stale.contains_key(hash)
    }

    fn genesis(&self) -> &BlockHeader {
        &self.chain.first().header
    }
}

impl BlockTree for BlockCache {
    /// Import blocks into the block tree. Blocks imported this way don't have to form a
    /// chain, but the first block must connect to a known block.
    fn import_blocks<I: Iterator<Item = BlockHeader>>(
        &mut self,
        chain: I,
    ) -> Result<ImportResult, Error> {
        let mut chain = chain.peekable();
        let (best, _) = self.tip();

        if let Some(first) = chain.peek() {
            if !self.is_known(&first.prev_blockhash) && !self.is_known(&first.block_hash()) {
                return Err(Error::BlockMissing(first.prev_blockhash));
            }
        }
        for header in chain {
            match self.import_block(header) {
                Ok(()) => {}
                Err(Error::DuplicateBlock(hash)) => {
                    log::trace!(target: "chain", "Duplicate block {}", hash)
                }
                Err(Error::BlockMissing(hash)) => {
                    log::trace!(target: "chain", "Missing block {}", hash)
                }
            }
        }
        let (hash, header) = self.tip();
        if hash == best {
            return Ok(ImportResult::TipUnchanged);
        }
        let fork = self.fork_point(&best, &hash);
        let fork_height = self.block_height(&fork).unwrap_or_default();

        let mut reverted = self
            .ancestors_since(&fork, &best)
            .into_iter()
            .zip(fork_height + 1..)
            .map(|(header, height)| (height, header))
            .collect::<Vec<_>>();
        // Highest first.
        reverted.reverse();
        let connected = self
            .ancestors_since(&fork, &hash)
            .into_iter()
            .zip(fork_height + 1..)
            .map(|(header, height)| (height, header))
            .collect::<Vec<_>>();
        let connected = NonEmpty::from_vec(connected)
            .expect("BlockCache::import_blocks: a new tip connects at least one block");

        Ok(ImportResult::TipChanged {
            header,
            hash,
            height: self.height(),
            reverted,
            connected,
        })
    }
}
