use ck_api_types::{ChainId, DappMetadata, WalletId, WalletMeta, WalletUrls};
use ck_connectors::{
    Connector, EmbeddedBackend, EmbeddedConnector, Environment, InMemoryEmbeddedBackend, InMemoryRelay,
    InjectedConnector, InjectedFlag, LocalWalletConnector, PairingRelay, QrConnector, SafeConfig, SmartWalletConfig,
    WrapperConfig, WrapperConnector, WrapperKind,
};
use ck_provider::{ChainRegistry, Eip1193Provider};
use ck_storage::{InMemoryKeystore, Keystore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// What kind of wallet a descriptor produces. The modal routes on this
/// instead of on wallet ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletKind {
    Injected(InjectedFlag),
    Qr,
    Wrapper(WrapperKind),
    Embedded,
    Local,
}

impl WalletKind {
    pub fn is_wrapper(self) -> bool {
        matches!(self, Self::Wrapper(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown wallet: {0}")]
    UnknownWallet(WalletId),
    #[error("{0} has no pairing fallback")]
    NoPairing(WalletId),
    #[error("{wallet} is not configured: {reason}")]
    NotConfigured { wallet: WalletId, reason: String },
}

/// Everything a connector factory may need. Shared by all descriptors of one
/// registry.
#[derive(Clone)]
pub struct CreateOptions {
    pub chains: ChainRegistry,
    pub default_chain: ChainId,
    pub dapp: DappMetadata,
    pub environment: Arc<dyn Environment>,
    pub keystore: Arc<dyn Keystore>,
    pub relay: Arc<dyn PairingRelay>,
    pub embedded_backend: Arc<dyn EmbeddedBackend>,
    /// Node used by key-backed wallets for calls they cannot answer.
    pub upstream: Option<Arc<dyn Eip1193Provider>>,
    pub safe: SafeConfig,
    pub smart_wallet: Option<SmartWalletConfig>,
}

impl CreateOptions {
    /// Options backed entirely by in-process stores and relays.
    pub fn in_memory(environment: Arc<dyn Environment>, dapp: DappMetadata) -> Self {
        let chains = ChainRegistry::with_defaults();
        Self {
            safe: SafeConfig {
                supported_chains: chains.chain_ids(),
            },
            chains,
            default_chain: ChainId::MAINNET,
            dapp,
            environment,
            keystore: Arc::new(InMemoryKeystore::default()),
            relay: Arc::new(InMemoryRelay::default()),
            embedded_backend: Arc::new(InMemoryEmbeddedBackend::default()),
            upstream: None,
            smart_wallet: None,
        }
    }
}

pub type ConnectorFactory = Arc<dyn Fn(&CreateOptions) -> Result<Arc<dyn Connector>, RegistryError> + Send + Sync>;

/// Static description of one wallet the app offers, plus the factory that
/// builds its connector on first use.
#[derive(Clone)]
pub struct WalletDescriptor {
    pub id: WalletId,
    pub meta: WalletMeta,
    pub kind: WalletKind,
    create: ConnectorFactory,
    pairing: Option<ConnectorFactory>,
}

impl std::fmt::Debug for WalletDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pairing", &self.pairing.is_some())
            .finish()
    }
}

impl WalletDescriptor {
    pub fn new(
        id: impl Into<WalletId>,
        meta: WalletMeta,
        kind: WalletKind,
        create: impl Fn(&CreateOptions) -> Result<Arc<dyn Connector>, RegistryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            meta,
            kind,
            create: Arc::new(create),
            pairing: None,
        }
    }

    /// Connector used when an injected wallet is not installed on desktop.
    #[must_use]
    pub fn with_pairing(
        mut self,
        pairing: impl Fn(&CreateOptions) -> Result<Arc<dyn Connector>, RegistryError> + Send + Sync + 'static,
    ) -> Self {
        self.pairing = Some(Arc::new(pairing));
        self
    }

    /// Builds a fresh connector. Same options, same configuration.
    pub fn create(&self, options: &CreateOptions) -> Result<Arc<dyn Connector>, RegistryError> {
        (self.create)(options)
    }

    pub fn create_pairing(&self, options: &CreateOptions) -> Result<Arc<dyn Connector>, RegistryError> {
        let pairing = self.pairing.as_ref().ok_or_else(|| RegistryError::NoPairing(self.id.clone()))?;
        pairing(options)
    }

    pub fn has_pairing(&self) -> bool {
        self.pairing.is_some()
    }

    pub fn metamask() -> Self {
        let meta = WalletMeta {
            name: "MetaMask".to_owned(),
            icon_url: "https://images.ctfassets.net/clixtyxoaeas/4rnpEzy1ATWRKVBOLxZ1Fm/a74dc1eed36d23d7ea6030383a4d5163/MetaMask-icon-fox.svg".to_owned(),
            urls: Some(WalletUrls {
                android: Some("https://play.google.com/store/apps/details?id=io.metamask".to_owned()),
                ios: Some("https://apps.apple.com/app/metamask/id1438144202".to_owned()),
                chrome: Some(
                    "https://chrome.google.com/webstore/detail/metamask/nkbihfbeogaeaoehlefnkodbefgpgknn".to_owned(),
                ),
                homepage: Some("https://metamask.io".to_owned()),
            }),
            deep_link: Some("https://metamask.app.link/dapp/".to_owned()),
        };
        Self::new("metamask", meta, WalletKind::Injected(InjectedFlag::MetaMask), |options| {
            Ok(Arc::new(InjectedConnector::new(
                "metamask",
                InjectedFlag::MetaMask,
                options.environment.clone(),
                options.chains.clone(),
            )))
        })
        .with_pairing(|options| Ok(qr_connector("metamask-qr", options)))
    }

    pub fn coinbase() -> Self {
        let meta = WalletMeta {
            name: "Coinbase Wallet".to_owned(),
            icon_url: "https://www.coinbase.com/assets/wallet/coinbase-wallet-logo.svg".to_owned(),
            urls: Some(WalletUrls {
                android: Some("https://play.google.com/store/apps/details?id=org.toshi".to_owned()),
                ios: Some("https://apps.apple.com/app/coinbase-wallet/id1278383455".to_owned()),
                chrome: Some(
                    "https://chrome.google.com/webstore/detail/coinbase-wallet-extension/hnfanknocfeofbddgcijnmhnfnkdnaad"
                        .to_owned(),
                ),
                homepage: Some("https://www.coinbase.com/wallet".to_owned()),
            }),
            deep_link: Some("https://go.cb-w.com/dapp?cb_url=".to_owned()),
        };
        Self::new("coinbase", meta, WalletKind::Injected(InjectedFlag::CoinbaseWallet), |options| {
            Ok(Arc::new(InjectedConnector::new(
                "coinbase",
                InjectedFlag::CoinbaseWallet,
                options.environment.clone(),
                options.chains.clone(),
            )))
        })
        .with_pairing(|options| Ok(qr_connector("coinbase-qr", options)))
    }

    pub fn walletconnect() -> Self {
        let meta = WalletMeta {
            name: "WalletConnect".to_owned(),
            icon_url: "https://walletconnect.com/walletconnect-logo.svg".to_owned(),
            urls: None,
            deep_link: None,
        };
        Self::new("walletconnect", meta, WalletKind::Qr, |options| {
            Ok(qr_connector("walletconnect", options))
        })
    }

    pub fn safe() -> Self {
        let meta = WalletMeta {
            name: "Safe".to_owned(),
            icon_url: "https://app.safe.global/images/safe-logo-green.png".to_owned(),
            urls: Some(WalletUrls {
                homepage: Some("https://safe.global".to_owned()),
                ..WalletUrls::default()
            }),
            deep_link: None,
        };
        Self::new("safe", meta, WalletKind::Wrapper(WrapperKind::Safe), |options| {
            Ok(Arc::new(WrapperConnector::new(
                "safe",
                WrapperConfig::Safe(options.safe.clone()),
            )))
        })
    }

    pub fn smart_wallet() -> Self {
        let meta = WalletMeta {
            name: "Smart Wallet".to_owned(),
            icon_url: "https://connectkit.invalid/icons/smart-wallet.svg".to_owned(),
            urls: None,
            deep_link: None,
        };
        Self::new("smart-wallet", meta, WalletKind::Wrapper(WrapperKind::SmartWallet), |options| {
            let config = options.smart_wallet.clone().ok_or_else(|| RegistryError::NotConfigured {
                wallet: WalletId::from("smart-wallet"),
                reason: "no account factory".to_owned(),
            })?;
            Ok(Arc::new(WrapperConnector::new("smart-wallet", WrapperConfig::SmartWallet(config))))
        })
    }

    pub fn embedded() -> Self {
        let meta = WalletMeta {
            name: "Email".to_owned(),
            icon_url: "https://connectkit.invalid/icons/email.svg".to_owned(),
            urls: None,
            deep_link: None,
        };
        Self::new("embedded", meta, WalletKind::Embedded, |options| {
            Ok(Arc::new(EmbeddedConnector::new(
                "embedded",
                options.embedded_backend.clone(),
                options.chains.clone(),
                options.default_chain,
                options.upstream.clone(),
            )))
        })
    }

    pub fn local() -> Self {
        let meta = WalletMeta {
            name: "Guest Wallet".to_owned(),
            icon_url: "https://connectkit.invalid/icons/guest.svg".to_owned(),
            urls: None,
            deep_link: None,
        };
        Self::new("local", meta, WalletKind::Local, |options| {
            Ok(Arc::new(LocalWalletConnector::new(
                "local",
                options.keystore.clone(),
                options.chains.clone(),
                options.default_chain,
                options.upstream.clone(),
            )))
        })
    }
}

fn qr_connector(id: &str, options: &CreateOptions) -> Arc<dyn Connector> {
    Arc::new(QrConnector::new(
        id,
        options.relay.clone(),
        options.dapp.clone(),
        options.chains.clone(),
        options.default_chain,
    ))
}

/// Per-render view of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletInfo {
    pub id: WalletId,
    pub meta: WalletMeta,
    pub kind: WalletKind,
    pub installed: bool,
    pub selectable: bool,
}

/// The wallets an app offers and the connector instances created for them.
/// Instances are built on first use and then reused for the app's lifetime.
pub struct WalletRegistry {
    descriptors: Vec<WalletDescriptor>,
    options: CreateOptions,
    instances: Mutex<HashMap<WalletId, Arc<dyn Connector>>>,
    pairing_instances: Mutex<HashMap<WalletId, Arc<dyn Connector>>>,
}

type InstanceMap = HashMap<WalletId, Arc<dyn Connector>>;

impl WalletRegistry {
    pub fn new(descriptors: Vec<WalletDescriptor>, options: CreateOptions) -> Self {
        Self {
            descriptors,
            options,
            instances: Mutex::new(HashMap::new()),
            pairing_instances: Mutex::new(HashMap::new()),
        }
    }

    /// The built-in wallets. Smart Wallet is listed only when the options
    /// carry an account factory.
    pub fn builtin(options: CreateOptions) -> Self {
        let mut descriptors = vec![
            WalletDescriptor::metamask(),
            WalletDescriptor::coinbase(),
            WalletDescriptor::walletconnect(),
            WalletDescriptor::safe(),
        ];
        if options.smart_wallet.is_some() {
            descriptors.push(WalletDescriptor::smart_wallet());
        }
        descriptors.push(WalletDescriptor::embedded());
        descriptors.push(WalletDescriptor::local());
        Self::new(descriptors, options)
    }

    pub fn options(&self) -> &CreateOptions {
        &self.options
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.options.environment
    }

    pub fn descriptors(&self) -> &[WalletDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: &WalletId) -> Result<&WalletDescriptor, RegistryError> {
        self.descriptors
            .iter()
            .find(|descriptor| &descriptor.id == id)
            .ok_or_else(|| RegistryError::UnknownWallet(id.clone()))
    }

    fn lock(map: &Mutex<InstanceMap>) -> MutexGuard<'_, InstanceMap> {
        map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The wallet's connector, created on first call.
    pub fn connector(&self, id: &WalletId) -> Result<Arc<dyn Connector>, RegistryError> {
        let descriptor = self.descriptor(id)?;
        let mut instances = Self::lock(&self.instances);
        if let Some(existing) = instances.get(id) {
            return Ok(existing.clone());
        }
        let connector = descriptor.create(&self.options)?;
        debug!(wallet = %id, "connector created");
        instances.insert(id.clone(), connector.clone());
        Ok(connector)
    }

    /// The wallet's QR fallback connector, created on first call.
    pub fn pairing_connector(&self, id: &WalletId) -> Result<Arc<dyn Connector>, RegistryError> {
        let descriptor = self.descriptor(id)?;
        let mut instances = Self::lock(&self.pairing_instances);
        if let Some(existing) = instances.get(id) {
            return Ok(existing.clone());
        }
        let connector = descriptor.create_pairing(&self.options)?;
        debug!(wallet = %id, "pairing connector created");
        instances.insert(id.clone(), connector.clone());
        Ok(connector)
    }

    /// Instance already created for `id`, if any.
    pub fn cached(&self, id: &WalletId) -> Option<Arc<dyn Connector>> {
        Self::lock(&self.instances).get(id).cloned()
    }

    pub fn is_installed(&self, descriptor: &WalletDescriptor) -> bool {
        match descriptor.kind {
            WalletKind::Injected(flag) => self.options.environment.injected_provider(flag).is_some(),
            _ => true,
        }
    }

    /// Wallet list as shown to the user. Inside a wrapper flow the wrappers
    /// themselves cannot be picked as the personal wallet.
    pub fn wallet_infos(&self, personal_only: bool) -> Vec<WalletInfo> {
        self.descriptors
            .iter()
            .filter(|descriptor| !(personal_only && descriptor.kind.is_wrapper()))
            .map(|descriptor| WalletInfo {
                id: descriptor.id.clone(),
                meta: descriptor.meta.clone(),
                kind: descriptor.kind,
                installed: self.is_installed(descriptor),
                selectable: true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dapp, options_with};
    use anyhow::Result;
    use ck_connectors::StaticEnvironment;

    #[tokio::test]
    async fn create_then_disconnect_leaves_no_listeners_for_every_wallet() -> Result<()> {
        let mut options = options_with(StaticEnvironment::new(false));
        options.smart_wallet = Some(crate::testing::smart_wallet_config());
        let registry = WalletRegistry::builtin(options);
        assert_eq!(registry.descriptors().len(), 7);

        for descriptor in registry.descriptors() {
            let connector = descriptor.create(registry.options())?;
            connector.disconnect().await?;
            connector.disconnect().await?;
            assert_eq!(connector.listener_count(), 0, "{}", descriptor.id);
            assert!(!connector.is_connected().await, "{}", descriptor.id);

            if descriptor.has_pairing() {
                let pairing = descriptor.create_pairing(registry.options())?;
                pairing.disconnect().await?;
                assert_eq!(pairing.listener_count(), 0, "{}", descriptor.id);
            }
        }
        Ok(())
    }

    #[test]
    fn create_is_deterministic_and_instances_are_cached() -> Result<()> {
        let registry = WalletRegistry::builtin(options_with(StaticEnvironment::new(false)));
        let id = WalletId::from("metamask");
        let descriptor = registry.descriptor(&id)?;

        let first = descriptor.create(registry.options())?;
        let second = descriptor.create(registry.options())?;
        assert_eq!(first.id(), second.id());
        assert_eq!(first.capabilities(), second.capabilities());

        let cached = registry.connector(&id)?;
        assert!(Arc::ptr_eq(&cached, &registry.connector(&id)?));
        assert!(registry.cached(&WalletId::from("coinbase")).is_none());
        Ok(())
    }

    #[test]
    fn smart_wallet_is_listed_only_when_configured() {
        let registry = WalletRegistry::builtin(options_with(StaticEnvironment::new(false)));
        assert!(registry.descriptor(&WalletId::from("smart-wallet")).is_err());
        assert!(matches!(
            registry.connector(&WalletId::from("nope")),
            Err(RegistryError::UnknownWallet(_))
        ));
    }

    #[test]
    fn installed_flag_follows_environment_and_wrappers_hide_in_personal_list() {
        let wallet = crate::testing::injected_wallet();
        let environment = StaticEnvironment::new(false).with_injected(InjectedFlag::MetaMask, wallet);
        let registry = WalletRegistry::builtin(CreateOptions::in_memory(Arc::new(environment), dapp()));

        let infos = registry.wallet_infos(false);
        let installed = |id: &str| infos.iter().find(|info| info.id.as_str() == id).map(|info| info.installed);
        assert_eq!(installed("metamask"), Some(true));
        assert_eq!(installed("coinbase"), Some(false));
        assert!(infos.iter().any(|info| info.kind.is_wrapper()));

        let personal = registry.wallet_infos(true);
        assert!(personal.iter().all(|info| !info.kind.is_wrapper()));
        assert!(personal.iter().any(|info| info.id.as_str() == "local"));
    }
}
