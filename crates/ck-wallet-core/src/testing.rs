//! Shared fixtures for the crate's tests.

use alloy_primitives::{Address, B256, address};
use async_trait::async_trait;
use ck_api_types::{ChainId, DappMetadata};
use ck_connectors::{
    Capabilities, ConnectParams, Connector, ConnectorError, ConnectorEvent, InjectedConnector, InjectedFlag, OtpLogin,
    QrPairing, SmartWalletConfig, StaticEnvironment, WrapperWallet,
};
use ck_crypto::LocalSigner;
use ck_provider::{ChainRegistry, Eip1193Provider, LocalProvider, MessageSigner};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

use crate::CreateOptions;

pub const SAFE_ADDRESS: Address = address!("0x00000000000000000000000000000000000005af");

pub fn dapp() -> DappMetadata {
    DappMetadata {
        name: "Test Dapp".to_owned(),
        url: "https://dapp.test".to_owned(),
        description: None,
        icons: Vec::new(),
    }
}

pub fn options_with(environment: StaticEnvironment) -> CreateOptions {
    CreateOptions::in_memory(Arc::new(environment), dapp())
}

pub fn smart_wallet_config() -> SmartWalletConfig {
    SmartWalletConfig {
        factory_address: address!("0x0000000000000000000000000000000000fac70e"),
        chain_id: ChainId::MAINNET,
        init_code_hash: B256::repeat_byte(0x42),
    }
}

/// Extension-like wallet that knows every default chain.
pub fn injected_wallet() -> Arc<LocalProvider> {
    Arc::new(
        LocalProvider::builder(Arc::new(LocalSigner::new_random()))
            .known_chains(ChainRegistry::with_defaults().chain_ids())
            .build(),
    )
}

pub fn injected_connector(wallet: Arc<LocalProvider>) -> Arc<dyn Connector> {
    let environment = StaticEnvironment::new(false).with_injected(InjectedFlag::MetaMask, wallet);
    Arc::new(InjectedConnector::new(
        "metamask",
        InjectedFlag::MetaMask,
        Arc::new(environment),
        ChainRegistry::with_defaults(),
    ))
}

/// Counts calls made to the wrapped connector.
pub struct RecordingConnector {
    inner: Arc<dyn Connector>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl RecordingConnector {
    pub fn new(inner: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn connect(&self, params: ConnectParams) -> Result<Address, ConnectorError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(params).await
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.disconnect().await
    }

    async fn address(&self) -> Result<Address, ConnectorError> {
        self.inner.address().await
    }

    async fn chain_id(&self) -> Result<ChainId, ConnectorError> {
        self.inner.chain_id().await
    }

    async fn provider(&self) -> Result<Arc<dyn Eip1193Provider>, ConnectorError> {
        self.inner.provider().await
    }

    async fn signer(&self) -> Result<Arc<dyn MessageSigner>, ConnectorError> {
        self.inner.signer().await
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ConnectorError> {
        self.inner.switch_chain(chain_id).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn is_authorized(&self) -> bool {
        self.inner.is_authorized().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.inner.subscribe()
    }

    fn listener_count(&self) -> usize {
        self.inner.listener_count()
    }

    fn as_pairing(&self) -> Option<&dyn QrPairing> {
        self.inner.as_pairing()
    }

    fn as_wrapper(&self) -> Option<&dyn WrapperWallet> {
        self.inner.as_wrapper()
    }

    fn as_otp(&self) -> Option<&dyn OtpLogin> {
        self.inner.as_otp()
    }
}
