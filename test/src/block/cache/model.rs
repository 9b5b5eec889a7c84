//! Block cache *model*.
//! Not for production use.
//!
//! Recomputes the active chain from scratch on every import, picking the longest
//! branch. The first branch seen wins ties.
use std::collections::{HashMap, VecDeque};

use herald_common::block::tree::{BlockTree, ChainView, Error, ImportResult};
use herald_common::block::{BlockHash, BlockHeader, Height};
use herald_common::nonempty::NonEmpty;

#[derive(Debug, Clone)]
pub struct Cache {
    pub headers: HashMap<BlockHash, BlockHeader>,
    pub chain: NonEmpty<BlockHeader>,
    pub genesis: BlockHash,
}

impl Cache {
    pub fn new(genesis: BlockHeader) -> Self {
        let mut headers = HashMap::new();
        let hash = genesis.block_hash();

        headers.insert(hash, genesis);

        Self {
            headers,
            chain: NonEmpty::new(genesis),
            genesis: hash,
        }
    }

    pub fn from(chain: NonEmpty<BlockHeader>) -> Self {
        let genesis = chain.head.block_hash();
        let headers = chain.iter().map(|h| (h.block_hash(), *h)).collect();

        Self {
            headers,
            chain,
            genesis,
        }
    }

    /// The branch from genesis to the given tip, if it connects.
    fn branch(&self, tip: &BlockHash) -> Option<NonEmpty<BlockHeader>> {
        let mut headers = VecDeque::new();
        let mut tip = *tip;

        while let Some(header) = self.headers.get(&tip) {
            tip = header.prev_blockhash;
            headers.push_front(*header);
        }

        match headers.pop_front() {
            Some(root) if root.block_hash() == self.genesis => {
                Some(NonEmpty::from((root, headers.into())))
            }
            _ => None,
        }
    }
}

impl ChainView for Cache {
    fn get_header(&self, hash: &BlockHash) -> Option<(Height, &BlockHeader)> {
        let header = self.headers.get(hash)?;
        let height = self.branch(hash)?.tail.len() as Height;

        Some((height, header))
    }

    fn get_block_by_height(&self, height: Height) -> Option<&BlockHeader> {
        self.chain.get(height as usize)
    }

    fn tip(&self) -> (BlockHash, BlockHeader) {
        let tip = self.chain.last();
        (tip.block_hash(), *tip)
    }

    fn height(&self) -> Height {
        self.chain.tail.len() as Height
    }

    fn is_on_active_chain(&self, hash: &BlockHash) -> bool {
        self.chain.iter().any(|h| h.block_hash() == *hash)
    }
}

impl BlockTree for Cache {
    fn import_blocks<I: Iterator<Item = BlockHeader>>(
        &mut self,
        chain: I,
    ) -> Result<ImportResult, Error> {
        let (best, _) = self.tip();
        let mut chain = chain.peekable();

        if let Some(first) = chain.peek() {
            if !self.headers.contains_key(&first.prev_blockhash)
                && !self.headers.contains_key(&first.block_hash())
            {
                return Err(Error::BlockMissing(first.prev_blockhash));
            }
        }
        for header in chain {
            let hash = header.block_hash();

            if self.headers.contains_key(&hash)
                || !self.headers.contains_key(&header.prev_blockhash)
            {
                continue;
            }
            self.headers.insert(hash, header);

            if let Some(branch) = self.branch(&hash) {
                if branch.len() > self.chain.len() {
                    self.chain = branch;
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

        Ok(ImportResult::TipChanged {
            header,
            hash,
            height: self.height(),
            reverted,
            connected: NonEmpty::from_vec(connected).unwrap(),
        })
    }
}
