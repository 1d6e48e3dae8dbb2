use alloy_primitives::{Address, B256, keccak256};
use async_trait::async_trait;
use ck_api_types::ChainId;
use ck_provider::{
    Eip1193Provider, Listener, ListenerId, MessageSigner, ProviderError, ProviderEvent, ProviderEventKind, RpcRequest,
    methods,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    Capabilities, ConnectParams, Connector, ConnectorError, ConnectorEvent, ProviderSession, WrapperWallet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    Safe,
    SmartWallet,
}

impl WrapperKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::SmartWallet => "Smart Wallet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeConfig {
    /// Networks Safe contracts are deployed on for this app.
    pub supported_chains: Vec<ChainId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartWalletConfig {
    pub factory_address: Address,
    pub chain_id: ChainId,
    pub init_code_hash: B256,
}

impl SmartWalletConfig {
    /// Counterfactual account address for `owner`: CREATE2 from the factory
    /// with `keccak256(owner)` as salt.
    pub fn account_address(&self, owner: Address) -> Address {
        let salt = keccak256(B256::left_padding_from(owner.as_slice()));
        self.factory_address.create2(salt.0, self.init_code_hash.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperConfig {
    Safe(SafeConfig),
    SmartWallet(SmartWalletConfig),
}

impl WrapperConfig {
    pub fn kind(&self) -> WrapperKind {
        match self {
            Self::Safe(_) => WrapperKind::Safe,
            Self::SmartWallet(_) => WrapperKind::SmartWallet,
        }
    }

    fn ensure_chain(&self, chain_id: ChainId) -> Result<(), ConnectorError> {
        let supported = match self {
            Self::Safe(config) => config.supported_chains.contains(&chain_id),
            Self::SmartWallet(config) => config.chain_id == chain_id,
        };
        if supported {
            Ok(())
        } else {
            Err(ConnectorError::UnsupportedChain {
                wallet: self.kind().label().to_owned(),
                chain_id,
            })
        }
    }
}

/// Provider for a contract account: reports the wrapper address and routes
/// signing to the personal wallet that owns it.
pub struct WrapperProvider {
    inner: Arc<dyn Eip1193Provider>,
    address: Address,
    owner: Address,
}

impl WrapperProvider {
    pub fn new(inner: Arc<dyn Eip1193Provider>, address: Address, owner: Address) -> Self {
        Self { inner, address, owner }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    fn rewrite_sign(&self, params: Value) -> Result<Value, ProviderError> {
        let data = params
            .get(0)
            .cloned()
            .ok_or_else(|| ProviderError::invalid_params("missing message"))?;
        let requested = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_params("missing address"))?;
        if !requested.eq_ignore_ascii_case(&self.address.to_checksum(None)) {
            return Err(ProviderError::unauthorized());
        }
        Ok(json!([data, self.owner.to_checksum(None)]))
    }
}

#[async_trait]
impl Eip1193Provider for WrapperProvider {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        match request.method.as_str() {
            methods::ETH_ACCOUNTS | methods::ETH_REQUEST_ACCOUNTS => Ok(json!([self.address.to_checksum(None)])),
            methods::PERSONAL_SIGN => {
                let params = self.rewrite_sign(request.params)?;
                self.inner.request(RpcRequest::new(methods::PERSONAL_SIGN, params)).await
            }
            _ => self.inner.request(request).await,
        }
    }

    fn on(&self, kind: ProviderEventKind, listener: Listener) -> ListenerId {
        let address = self.address;
        self.inner.on(
            kind,
            Arc::new(move |event| match event {
                // The owner changing accounts does not move the contract account.
                ProviderEvent::AccountsChanged(accounts) if !accounts.is_empty() => {
                    listener(&ProviderEvent::AccountsChanged(vec![address]));
                }
                other => listener(other),
            }),
        )
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    fn listener_count(&self) -> usize {
        self.inner.listener_count()
    }
}

/// Safe or smart-account wallet driven by a personal wallet.
///
/// The personal wallet is selected and connected first; `connect` only
/// derives the contract account on top of it.
pub struct WrapperConnector {
    id: String,
    config: WrapperConfig,
    personal: Mutex<Option<Arc<dyn Connector>>>,
    session: ProviderSession,
}

impl WrapperConnector {
    pub fn new(id: impl Into<String>, config: WrapperConfig) -> Self {
        let id = id.into();
        Self {
            session: ProviderSession::new(id.clone()),
            id,
            config,
            personal: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    fn personal(&self) -> MutexGuard<'_, Option<Arc<dyn Connector>>> {
        self.personal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wrapper_address(&self, owner: Address, params: &ConnectParams) -> Result<Address, ConnectorError> {
        match &self.config {
            WrapperConfig::Safe(_) => params.safe_address.ok_or(ConnectorError::MissingParameter("safe_address")),
            WrapperConfig::SmartWallet(config) => Ok(config.account_address(owner)),
        }
    }
}

impl WrapperWallet for WrapperConnector {
    fn wrapper_kind(&self) -> WrapperKind {
        self.config.kind()
    }

    fn set_personal_wallet(&self, personal: Arc<dyn Connector>) -> Option<Arc<dyn Connector>> {
        debug!(connector = %self.id, personal = personal.id(), "personal wallet set");
        self.personal().replace(personal)
    }

    fn personal_wallet(&self) -> Option<Arc<dyn Connector>> {
        self.personal().clone()
    }
}

#[async_trait]
impl Connector for WrapperConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            wrapper: Some(self.config.kind()),
            ..Capabilities::default()
        }
    }

    async fn connect(&self, params: ConnectParams) -> Result<Address, ConnectorError> {
        let Some(personal) = self.personal_wallet() else {
            return Err(if params.silent {
                ConnectorError::NotAuthorized
            } else {
                ConnectorError::PersonalWalletRequired
            });
        };
        if !personal.is_connected().await {
            return Err(ConnectorError::PersonalWalletRequired);
        }

        let current = personal.chain_id().await?;
        let chain_id = params.chain_id.unwrap_or(current);
        self.config.ensure_chain(chain_id)?;
        let owner = personal.address().await?;
        let address = self.wrapper_address(owner, &params)?;

        let generation = self.session.begin();
        if chain_id != current {
            personal.switch_chain(chain_id).await?;
        }

        let inner = personal.provider().await?;
        let provider = Arc::new(WrapperProvider::new(inner, address, owner));
        self.session.establish(generation, provider, address, chain_id)?;
        info!(connector = %self.id, %owner, %address, "contract account ready");
        Ok(address)
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.session.teardown();
        let personal = self.personal().take();
        if let Some(personal) = personal {
            if let Err(err) = personal.disconnect().await {
                warn!(connector = %self.id, error = %err, "personal wallet disconnect failed");
            }
        }
        Ok(())
    }

    async fn address(&self) -> Result<Address, ConnectorError> {
        self.session.account()
    }

    async fn chain_id(&self) -> Result<ChainId, ConnectorError> {
        self.session.chain_id()
    }

    async fn provider(&self) -> Result<Arc<dyn Eip1193Provider>, ConnectorError> {
        self.session.provider()
    }

    async fn signer(&self) -> Result<Arc<dyn MessageSigner>, ConnectorError> {
        self.session.signer()
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ConnectorError> {
        self.config.ensure_chain(chain_id)?;
        let personal = self.personal_wallet().ok_or(ConnectorError::NotConnected)?;
        personal.switch_chain(chain_id).await?;
        self.session.set_chain_id(chain_id);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn is_authorized(&self) -> bool {
        self.session.is_connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.session.subscribe()
    }

    fn listener_count(&self) -> usize {
        self.session.listener_count()
    }

    fn as_wrapper(&self) -> Option<&dyn WrapperWallet> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InjectedConnector, InjectedFlag, StaticEnvironment};
    use alloy_primitives::{address, b256, hex};
    use anyhow::Result;
    use ck_crypto::{LocalSigner, recover_address};
    use ck_provider::{ChainRegistry, LocalProvider};

    const SAFE: Address = address!("0x00000000000000000000000000000000000005af");

    fn personal() -> (Arc<LocalProvider>, Arc<dyn Connector>) {
        let wallet = Arc::new(
            LocalProvider::builder(Arc::new(LocalSigner::new_random()))
                .known_chains([ChainId::SEPOLIA])
                .build(),
        );
        let environment = StaticEnvironment::new(false).with_injected(InjectedFlag::Generic, wallet.clone());
        let connector = InjectedConnector::new(
            "injected",
            InjectedFlag::Generic,
            Arc::new(environment),
            ChainRegistry::with_defaults(),
        );
        (wallet, Arc::new(connector))
    }

    fn safe() -> WrapperConnector {
        WrapperConnector::new(
            "safe",
            WrapperConfig::Safe(SafeConfig {
                supported_chains: vec![ChainId::MAINNET, ChainId::SEPOLIA],
            }),
        )
    }

    fn safe_params() -> ConnectParams {
        ConnectParams {
            safe_address: Some(SAFE),
            ..ConnectParams::default()
        }
    }

    #[tokio::test]
    async fn connect_requires_personal_wallet() -> Result<()> {
        let safe = safe();
        assert_eq!(
            safe.connect(safe_params()).await.unwrap_err(),
            ConnectorError::PersonalWalletRequired
        );

        let (_wallet, personal) = personal();
        safe.set_personal_wallet(personal);
        assert_eq!(
            safe.connect(safe_params()).await.unwrap_err(),
            ConnectorError::PersonalWalletRequired
        );
        Ok(())
    }

    #[tokio::test]
    async fn safe_address_is_account_and_owner_signs() -> Result<()> {
        let (wallet, personal) = personal();
        personal.connect(ConnectParams::default()).await?;
        let safe = safe();
        safe.set_personal_wallet(personal.clone());

        assert_eq!(safe.connect(safe_params()).await?, SAFE);
        assert_eq!(safe.address().await?, SAFE);
        assert_eq!(personal.address().await?, wallet.signer().address());

        let accounts = safe
            .provider()
            .await?
            .request(RpcRequest::method_only(methods::ETH_ACCOUNTS))
            .await?;
        assert_eq!(accounts, json!([SAFE.to_checksum(None)]));

        let signature = safe.signer().await?.sign_message(b"hello safe").await?;
        let recovered = recover_address(b"hello safe", &hex::decode(signature)?)?;
        assert_eq!(recovered, wallet.signer().address());
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_chain_fails_before_any_change() -> Result<()> {
        let (wallet, personal) = personal();
        personal.connect(ConnectParams::default()).await?;
        let safe = safe();
        safe.set_personal_wallet(personal.clone());

        let err = safe
            .connect(safe_params().with_chain(ChainId::POLYGON))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConnectorError::UnsupportedChain {
                wallet: "Safe".to_owned(),
                chain_id: ChainId::POLYGON
            }
        );
        assert!(!safe.is_connected().await);
        assert!(personal.is_connected().await);
        assert_eq!(wallet.chain_id(), ChainId::MAINNET);
        assert_eq!(wallet.count_requests(methods::WALLET_SWITCH_CHAIN), 0);
        Ok(())
    }

    #[tokio::test]
    async fn safe_on_other_supported_chain_switches_personal_wallet() -> Result<()> {
        let (wallet, personal) = personal();
        personal.connect(ConnectParams::default()).await?;
        let safe = safe();
        safe.set_personal_wallet(personal.clone());

        safe.connect(safe_params().with_chain(ChainId::SEPOLIA)).await?;
        assert_eq!(wallet.chain_id(), ChainId::SEPOLIA);
        assert_eq!(safe.chain_id().await?, ChainId::SEPOLIA);
        Ok(())
    }

    #[tokio::test]
    async fn smart_wallet_address_is_counterfactual() -> Result<()> {
        let config = SmartWalletConfig {
            factory_address: address!("0x5de4839a76cf55d0c90e2061ef4386d962e15ae3"),
            chain_id: ChainId::MAINNET,
            init_code_hash: b256!("0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f"),
        };
        let (wallet, personal) = personal();
        personal.connect(ConnectParams::default()).await?;
        let smart = WrapperConnector::new("smart-wallet", WrapperConfig::SmartWallet(config.clone()));
        smart.set_personal_wallet(personal);

        let address = smart.connect(ConnectParams::default()).await?;
        assert_eq!(address, config.account_address(wallet.signer().address()));
        assert_ne!(address, wallet.signer().address());
        assert_eq!(
            smart.connect(ConnectParams::default().with_chain(ChainId::BASE)).await.unwrap_err(),
            ConnectorError::UnsupportedChain {
                wallet: "Smart Wallet".to_owned(),
                chain_id: ChainId::BASE
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn owner_account_change_keeps_contract_account() -> Result<()> {
        let (wallet, personal) = personal();
        personal.connect(ConnectParams::default()).await?;
        let safe = safe();
        safe.set_personal_wallet(personal);
        safe.connect(safe_params()).await?;

        wallet.change_chain(ChainId::SEPOLIA);
        assert_eq!(safe.chain_id().await?, ChainId::SEPOLIA);
        assert_eq!(safe.address().await?, SAFE);

        wallet.lock_wallet();
        assert!(!safe.is_connected().await);
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_tears_down_personal_wallet() -> Result<()> {
        let (wallet, personal) = personal();
        personal.connect(ConnectParams::default()).await?;
        let safe = safe();
        safe.set_personal_wallet(personal.clone());
        safe.connect(safe_params()).await?;
        assert_eq!(wallet.listener_count(), 6);

        safe.disconnect().await?;
        assert!(!personal.is_connected().await);
        assert!(safe.personal_wallet().is_none());
        assert_eq!(wallet.listener_count(), 0);

        safe.disconnect().await?;
        Ok(())
    }
}
