use alloy_primitives::Address;
use async_trait::async_trait;
use ck_api_types::ChainId;
use ck_crypto::{KeyMaterialError, LocalSigner, decrypt_key_material, encrypt_key_material};
use ck_provider::{ChainRegistry, Eip1193Provider, LocalProvider, MessageSigner};
use ck_storage::Keystore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use zeroize::Zeroize;

use crate::{
    Capabilities, ConnectParams, Connector, ConnectorError, ConnectorEvent, ProviderSession,
    switch_chain_with_fallback,
};

/// Keystore slot holding the password-encrypted guest key.
pub const LOCAL_WALLET_SLOT: &str = "local-wallet";

/// Guest wallet with a key generated in process.
///
/// Without a password the key is ephemeral. With one, the key saved under
/// [`LOCAL_WALLET_SLOT`] is unlocked, or a new key is created and saved.
pub struct LocalWalletConnector {
    id: String,
    keystore: Arc<dyn Keystore>,
    chains: ChainRegistry,
    default_chain: ChainId,
    upstream: Option<Arc<dyn Eip1193Provider>>,
    session: ProviderSession,
}

impl LocalWalletConnector {
    pub fn new(
        id: impl Into<String>,
        keystore: Arc<dyn Keystore>,
        chains: ChainRegistry,
        default_chain: ChainId,
        upstream: Option<Arc<dyn Eip1193Provider>>,
    ) -> Self {
        let id = id.into();
        Self {
            session: ProviderSession::new(id.clone()),
            id,
            keystore,
            chains,
            default_chain,
            upstream,
        }
    }

    pub async fn has_saved_wallet(&self) -> Result<bool, ConnectorError> {
        let saved = self
            .keystore
            .load_encrypted_key(LOCAL_WALLET_SLOT)
            .await
            .map_err(ConnectorError::backend)?;
        Ok(saved.is_some())
    }

    pub async fn forget_saved_wallet(&self) -> Result<(), ConnectorError> {
        self.keystore
            .delete_encrypted_key(LOCAL_WALLET_SLOT)
            .await
            .map_err(ConnectorError::backend)
    }

    async fn unlock_or_create(&self, password: &str) -> Result<LocalSigner, ConnectorError> {
        let saved = self
            .keystore
            .load_encrypted_key(LOCAL_WALLET_SLOT)
            .await
            .map_err(ConnectorError::backend)?;

        if let Some(encrypted) = saved {
            let secret = decrypt_key_material(&encrypted, password).map_err(|err| match err {
                KeyMaterialError::InvalidPassword | KeyMaterialError::EmptyPassword => ConnectorError::InvalidPassword,
                other => ConnectorError::backend(other),
            })?;
            let signer = LocalSigner::from_secret_key_bytes(secret).map_err(ConnectorError::backend)?;
            info!(connector = %self.id, "saved guest wallet unlocked");
            return Ok(signer);
        }

        let signer = LocalSigner::new_random();
        let mut secret = signer.secret_key_bytes();
        let encrypted = encrypt_key_material(&secret, password);
        secret.zeroize();
        let encrypted = encrypted.map_err(|err| match err {
            KeyMaterialError::EmptyPassword => ConnectorError::InvalidPassword,
            other => ConnectorError::backend(other),
        })?;
        self.keystore
            .save_encrypted_key(LOCAL_WALLET_SLOT, encrypted)
            .await
            .map_err(ConnectorError::backend)?;
        info!(connector = %self.id, address = %signer.address(), "guest wallet created and saved");
        Ok(signer)
    }
}

#[async_trait]
impl Connector for LocalWalletConnector {
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
        if params.silent {
            return Err(ConnectorError::NotAuthorized);
        }
        let chain_id = params.chain_id.unwrap_or(self.default_chain);
        if !self.chains.contains(chain_id) {
            return Err(ConnectorError::ChainNotConfigured {
                chain_id,
                reason: "not in the app chain list".to_owned(),
            });
        }

        let generation = self.session.begin();
        let signer = match params.password.as_deref() {
            Some(password) => self.unlock_or_create(password).await?,
            None => LocalSigner::new_random(),
        };
        let address = signer.address();

        let mut builder = LocalProvider::builder(Arc::new(signer))
            .known_chains(self.chains.chain_ids())
            .chain(chain_id)
            .authorized(true);
        if let Some(upstream) = &self.upstream {
            builder = builder.upstream(upstream.clone());
        }

        self.session.establish(generation, Arc::new(builder.build()), address, chain_id)?;
        Ok(address)
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
        self.session.is_connected()
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
    use anyhow::Result;
    use ck_storage::InMemoryKeystore;

    fn connector(keystore: Arc<InMemoryKeystore>) -> LocalWalletConnector {
        LocalWalletConnector::new(
            "local",
            keystore,
            ChainRegistry::with_defaults(),
            ChainId::MAINNET,
            None,
        )
    }

    fn with_password(password: &str) -> ConnectParams {
        ConnectParams {
            password: Some(password.to_owned()),
            ..ConnectParams::default()
        }
    }

    #[tokio::test]
    async fn guest_without_password_is_ephemeral() -> Result<()> {
        let keystore = Arc::new(InMemoryKeystore::default());
        let connector = connector(keystore.clone());

        let first = connector.connect(ConnectParams::default()).await?;
        connector.disconnect().await?;
        let second = connector.connect(ConnectParams::default()).await?;

        assert_ne!(first, second);
        assert!(!connector.has_saved_wallet().await?);
        Ok(())
    }

    #[tokio::test]
    async fn password_saves_and_unlocks_same_key() -> Result<()> {
        let keystore = Arc::new(InMemoryKeystore::default());
        let connector = connector(keystore.clone());

        let created = connector.connect(with_password("hunter22")).await?;
        assert!(connector.has_saved_wallet().await?);
        connector.disconnect().await?;

        let unlocked = connector.connect(with_password("hunter22")).await?;
        assert_eq!(created, unlocked);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_is_refused() -> Result<()> {
        let keystore = Arc::new(InMemoryKeystore::default());
        let connector = connector(keystore.clone());
        connector.connect(with_password("hunter22")).await?;
        connector.disconnect().await?;

        assert_eq!(
            connector.connect(with_password("nope")).await.unwrap_err(),
            ConnectorError::InvalidPassword
        );
        assert!(!connector.is_connected().await);

        connector.forget_saved_wallet().await?;
        assert!(!connector.has_saved_wallet().await?);
        Ok(())
    }

    #[tokio::test]
    async fn guest_can_sign_and_switch_configured_chains() -> Result<()> {
        let connector = connector(Arc::new(InMemoryKeystore::default()));
        let address = connector.connect(ConnectParams::default()).await?;

        let signature = connector.signer().await?.sign_message(b"guest").await?;
        let bytes = alloy_primitives::hex::decode(signature)?;
        assert_eq!(ck_crypto::recover_address(b"guest", &bytes)?, address);

        connector.switch_chain(ChainId::POLYGON).await?;
        assert_eq!(connector.chain_id().await?, ChainId::POLYGON);
        Ok(())
    }

    #[tokio::test]
    async fn silent_connect_is_never_authorized() {
        let connector = connector(Arc::new(InMemoryKeystore::default()));
        assert_eq!(
            connector.connect(ConnectParams::silent()).await.unwrap_err(),
            ConnectorError::NotAuthorized
        );
    }
}
