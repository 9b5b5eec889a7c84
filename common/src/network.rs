//! Bitcoin peer network. Eg. *Mainnet*.
use bitcoin::blockdata::block::BlockHeader;
use bitcoin::hash_types::BlockHash;

/// Bitcoin peer network.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Network {
    /// Bitcoin Mainnet.
    #[default]
    Mainnet,
    /// Bitcoin Testnet.
    Testnet,
    /// Bitcoin regression test net.
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(value: Network) -> Self {
        match value {
            Network::Mainnet => Self::Bitcoin,
            Network::Testnet => Self::Testnet,
            Network::Regtest => Self::Regtest,
        }
    }
}

impl Network {
    /// Return the short string representation of this network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Get the genesis block header. Block trees are rooted at it.
    ///
    /// ```
    /// use herald_common::network::Network;
    ///
    /// let regtest = Network::Regtest;
    ///
    /// assert_eq!(regtest.genesis_hash(), regtest.genesis().block_hash());
    /// assert_ne!(regtest.genesis_hash(), Network::Mainnet.genesis_hash());
    /// ```
    pub fn genesis(&self) -> BlockHeader {
        bitcoin::blockdata::constants::genesis_block((*self).into()).header
    }

    /// Get the hash of the genesis block of this network.
    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis().block_hash()
    }
}
