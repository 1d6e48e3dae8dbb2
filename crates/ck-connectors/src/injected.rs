use alloy_primitives::Address;
use async_trait::async_trait;
use ck_api_types::ChainId;
use ck_provider::{ChainRegistry, Eip1193Provider, MessageSigner, current_chain_id, request_accounts};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    Capabilities, ConnectParams, Connector, ConnectorError, ConnectorEvent, Environment, InjectedFlag, ProviderSession,
    switch_chain_with_fallback,
};

/// Browser-extension wallet reached through the provider the host injects.
pub struct InjectedConnector {
    id: String,
    flag: InjectedFlag,
    environment: Arc<dyn Environment>,
    chains: ChainRegistry,
    session: ProviderSession,
}

impl InjectedConnector {
    pub fn new(id: impl Into<String>, flag: InjectedFlag, environment: Arc<dyn Environment>, chains: ChainRegistry) -> Self {
        let id = id.into();
        Self {
            session: ProviderSession::new(id.clone()),
            id,
            flag,
            environment,
            chains,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.environment.injected_provider(self.flag).is_some()
    }

    fn injected(&self) -> Result<Arc<dyn Eip1193Provider>, ConnectorError> {
        self.environment
            .injected_provider(self.flag)
            .ok_or(ConnectorError::NotInstalled)
    }
}

#[async_trait]
impl Connector for InjectedConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            add_chain: true,
            ..Capabilities::default()
        }
    }

    async fn connect(&self, params: ConnectParams) -> Result<Address, ConnectorError> {
        let provider = self.injected()?;
        let generation = self.session.begin();
        debug!(connector = %self.id, silent = params.silent, "requesting accounts");

        let accounts = request_accounts(provider.as_ref(), params.silent).await?;
        let account = *accounts.first().ok_or(if params.silent {
            ConnectorError::NotAuthorized
        } else {
            ConnectorError::UserRejected
        })?;

        let mut chain_id = current_chain_id(provider.as_ref()).await?;
        if let Some(target) = params.chain_id.filter(|target| *target != chain_id) {
            switch_chain_with_fallback(provider.as_ref(), target, &self.chains, true).await?;
            chain_id = target;
        }

        self.session.establish(generation, provider, account, chain_id)?;
        Ok(account)
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.session.teardown();
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
        let provider = self.session.provider()?;
        switch_chain_with_fallback(provider.as_ref(), chain_id, &self.chains, true).await?;
        self.session.set_chain_id(chain_id);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn is_authorized(&self) -> bool {
        let Ok(provider) = self.injected() else {
            return false;
        };
        request_accounts(provider.as_ref(), true)
            .await
            .map(|accounts| !accounts.is_empty())
            .unwrap_or(false)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.session.subscribe()
    }

    fn listener_count(&self) -> usize {
        self.session.listener_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticEnvironment;
    use ck_crypto::LocalSigner;
    use ck_provider::{Approval, LocalProvider, methods};

    fn setup(approval: Approval) -> (Arc<LocalProvider>, InjectedConnector) {
        let wallet = Arc::new(
            LocalProvider::builder(Arc::new(LocalSigner::new_random()))
                .approval(approval)
                .build(),
        );
        let environment = StaticEnvironment::new(false).with_injected(InjectedFlag::MetaMask, wallet.clone());
        let connector = InjectedConnector::new(
            "metamask",
            InjectedFlag::MetaMask,
            Arc::new(environment),
            ChainRegistry::with_defaults(),
        );
        (wallet, connector)
    }

    #[tokio::test]
    async fn connect_returns_wallet_address_and_reconnect_keeps_listeners() {
        let (wallet, connector) = setup(Approval::Auto);

        let address = connector.connect(ConnectParams::default()).await.unwrap();
        assert_eq!(address, wallet.signer().address());
        assert_eq!(connector.listener_count(), 3);

        connector.connect(ConnectParams::default()).await.unwrap();
        assert_eq!(connector.listener_count(), 3);
        assert_eq!(wallet.listener_count(), 3);
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_harmless() {
        let (wallet, connector) = setup(Approval::Auto);
        connector.disconnect().await.unwrap();
        connector.disconnect().await.unwrap();
        assert_eq!(connector.listener_count(), 0);
        assert_eq!(wallet.listener_count(), 0);
        assert_eq!(connector.address().await.unwrap_err(), ConnectorError::NotConnected);
    }

    #[tokio::test]
    async fn rejection_maps_to_user_rejected() {
        let (_wallet, connector) = setup(Approval::Reject);
        let err = connector.connect(ConnectParams::default()).await.unwrap_err();
        assert!(err.is_user_rejected());
        assert!(!connector.is_connected().await);
    }

    #[tokio::test]
    async fn not_installed_fails_before_any_request() {
        let connector = InjectedConnector::new(
            "coinbase",
            InjectedFlag::CoinbaseWallet,
            Arc::new(StaticEnvironment::new(false)),
            ChainRegistry::with_defaults(),
        );
        assert!(!connector.is_installed());
        assert_eq!(
            connector.connect(ConnectParams::default()).await.unwrap_err(),
            ConnectorError::NotInstalled
        );
    }

    #[tokio::test]
    async fn switch_to_known_chain_never_adds_it() {
        let (wallet, connector) = setup(Approval::Auto);
        connector.connect(ConnectParams::default()).await.unwrap();
        wallet.change_chain(ChainId::POLYGON);
        wallet.change_chain(ChainId::MAINNET);

        connector.switch_chain(ChainId::POLYGON).await.unwrap();
        assert_eq!(connector.chain_id().await.unwrap(), ChainId::POLYGON);
        assert_eq!(wallet.count_requests(methods::WALLET_ADD_CHAIN), 0);
    }

    #[tokio::test]
    async fn switch_to_unknown_chain_adds_it_first() {
        let (wallet, connector) = setup(Approval::Auto);
        connector.connect(ConnectParams::default()).await.unwrap();

        connector.switch_chain(ChainId::BASE).await.unwrap();
        assert_eq!(wallet.count_requests(methods::WALLET_ADD_CHAIN), 1);
        assert_eq!(wallet.chain_id(), ChainId::BASE);
    }

    #[tokio::test]
    async fn failed_add_surfaces_chain_not_configured() {
        let wallet = Arc::new(
            LocalProvider::builder(Arc::new(LocalSigner::new_random()))
                .add_chain_supported(false)
                .build(),
        );
        let environment = StaticEnvironment::new(false).with_injected(InjectedFlag::MetaMask, wallet.clone());
        let connector = InjectedConnector::new(
            "metamask",
            InjectedFlag::MetaMask,
            Arc::new(environment),
            ChainRegistry::with_defaults(),
        );
        connector.connect(ConnectParams::default()).await.unwrap();

        let err = connector.switch_chain(ChainId::BASE).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ChainNotConfigured { chain_id, .. } if chain_id == ChainId::BASE));
        assert_eq!(wallet.count_requests(methods::WALLET_ADD_CHAIN), 1);
        assert_eq!(connector.chain_id().await.unwrap(), ChainId::MAINNET);
    }

    #[tokio::test]
    async fn chain_outside_app_config_is_not_configured() {
        let (wallet, connector) = setup(Approval::Auto);
        connector.connect(ConnectParams::default()).await.unwrap();

        let err = connector.switch_chain(ChainId(424242)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ChainNotConfigured { .. }));
        assert_eq!(wallet.count_requests(methods::WALLET_ADD_CHAIN), 0);
    }

    #[tokio::test]
    async fn silent_connect_requires_prior_authorization() {
        let (_wallet, connector) = setup(Approval::Auto);
        assert!(!connector.is_authorized().await);
        assert_eq!(
            connector.connect(ConnectParams::silent()).await.unwrap_err(),
            ConnectorError::NotAuthorized
        );

        connector.connect(ConnectParams::default()).await.unwrap();
        connector.disconnect().await.unwrap();
        assert!(connector.is_authorized().await);
        connector.connect(ConnectParams::silent()).await.unwrap();
    }
}
