pub use herald_common::block::*;

pub mod cache {
    pub mod model;
}

pub mod gen {
    use herald_common::bitcoin;
    use herald_common::bitcoin_hashes::Hash as _;
    use herald_common::block::*;
    use herald_common::nonempty::NonEmpty;

    use bitcoin::hash_types::TxMerkleNode;

    /// The regtest genesis header. All generated chains use its difficulty, so that the
    /// chain with the most work is always the longest.
    pub fn genesis() -> BlockHeader {
        bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Regtest).header
    }

    /// Generate a random header on top of a previous header.
    ///
    /// Proof-of-work is not solved: block trees in this workspace don't validate it.
    pub fn header(prev_header: &BlockHeader, rng: &mut fastrand::Rng) -> BlockHeader {
        let target_spacing = 60 * 10; // 10 minutes.
        let delta = rng.u32(target_spacing - 60..target_spacing + 60);

        BlockHeader {
            version: 1,
            time: prev_header.time + delta,
            nonce: rng.u32(..),
            bits: prev_header.bits,
            merkle_root: TxMerkleNode::all_zeros(),
            prev_blockhash: prev_header.block_hash(),
        }
    }

    /// Generate a random header chain of `length` blocks on top of `parent`. The parent
    /// is included as the first element.
    pub fn headers(
        parent: BlockHeader,
        length: usize,
        rng: &mut fastrand::Rng,
    ) -> NonEmpty<BlockHeader> {
        let mut prev_header = parent;
        let mut chain = NonEmpty::new(parent);

        for _ in 0..length {
            let header = header(&prev_header, rng);
            prev_header = header;

            chain.push(header);
        }
        chain
    }

    /// Generate a branch of `length` headers forking off `parent`. The parent is not
    /// included.
    pub fn fork(parent: &BlockHeader, length: usize, rng: &mut fastrand::Rng) -> Vec<BlockHeader> {
        assert!(length > 0);

        headers(*parent, length, rng).tail
    }
}

pub mod arbitrary {
    use herald_common::block::BlockHeader;
    use herald_common::nonempty::NonEmpty;

    use quickcheck::{Arbitrary, Gen};

    use super::gen;

    /// A random header chain starting at the regtest genesis.
    #[derive(Clone, Debug)]
    pub struct ArbitraryChain(pub NonEmpty<BlockHeader>);

    impl ArbitraryChain {
        /// Height of the chain tip.
        pub fn height(&self) -> u64 {
            self.0.tail.len() as u64
        }
    }

    impl Arbitrary for ArbitraryChain {
        fn arbitrary(g: &mut Gen) -> Self {
            let mut rng = fastrand::Rng::with_seed(u64::arbitrary(g));
            let length = rng.usize(1..32);

            Self(gen::headers(gen::genesis(), length, &mut rng))
        }
    }
}
