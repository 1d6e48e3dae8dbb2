use ck_api_types::{Chain, ChainId, NativeCurrency};
use std::collections::BTreeMap;

/// Chains the dapp is configured for. Used to answer "can this chain be
/// added to the wallet" when a switch fails with 4902.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<ChainId, Chain>,
}

impl ChainRegistry {
    pub fn new(chains: impl IntoIterator<Item = Chain>) -> Self {
        let mut registry = Self::default();
        for chain in chains {
            registry.register(chain);
        }
        registry
    }

    pub fn with_defaults() -> Self {
        Self::new(builtin_chains())
    }

    pub fn register(&mut self, chain: Chain) {
        self.chains.insert(chain.chain_id, chain);
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&Chain> {
        self.chains.get(&chain_id)
    }

    pub fn contains(&self, chain_id: ChainId) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

fn ether() -> NativeCurrency {
    NativeCurrency {
        name: "Ether".to_owned(),
        symbol: "ETH".to_owned(),
        decimals: 18,
    }
}

pub fn builtin_chains() -> Vec<Chain> {
    vec![
        Chain {
            chain_id: ChainId::MAINNET,
            name: "Ethereum".to_owned(),
            rpc_urls: vec!["https://eth.llamarpc.com".to_owned()],
            native_currency: ether(),
            block_explorer_urls: vec!["https://etherscan.io".to_owned()],
            testnet: false,
        },
        Chain {
            chain_id: ChainId::SEPOLIA,
            name: "Sepolia".to_owned(),
            rpc_urls: vec!["https://rpc.sepolia.org".to_owned()],
            native_currency: NativeCurrency {
                name: "Sepolia Ether".to_owned(),
                symbol: "ETH".to_owned(),
                decimals: 18,
            },
            block_explorer_urls: vec!["https://sepolia.etherscan.io".to_owned()],
            testnet: true,
        },
        Chain {
            chain_id: ChainId::POLYGON,
            name: "Polygon".to_owned(),
            rpc_urls: vec!["https://polygon-rpc.com".to_owned()],
            native_currency: NativeCurrency {
                name: "POL".to_owned(),
                symbol: "POL".to_owned(),
                decimals: 18,
            },
            block_explorer_urls: vec!["https://polygonscan.com".to_owned()],
            testnet: false,
        },
        Chain {
            chain_id: ChainId::BASE,
            name: "Base".to_owned(),
            rpc_urls: vec!["https://mainnet.base.org".to_owned()],
            native_currency: ether(),
            block_explorer_urls: vec!["https://basescan.org".to_owned()],
            testnet: false,
        },
    ]
}
