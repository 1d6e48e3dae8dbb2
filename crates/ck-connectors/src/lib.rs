//! Uniform connector contract over heterogeneous wallets.
//!
//! Every wallet kind (browser extension, paired phone, Safe/smart-account
//! wrapper, email-based custodial wallet, in-process guest key) is driven
//! through [`Connector`]. Connectors own exactly the provider listeners they
//! attached; see [`ProviderSession`].

use alloy_primitives::Address;
use async_trait::async_trait;
use ck_api_types::ChainId;
use ck_provider::{Eip1193Provider, MessageSigner};
use std::sync::Arc;
use tokio::sync::broadcast;

mod embedded;
mod environment;
mod error;
mod injected;
mod local;
mod qr;
mod session;
mod wrapper;

pub use embedded::{EmbeddedBackend, EmbeddedConnector, EmbeddedProvider, EmbeddedSession, InMemoryEmbeddedBackend};
pub use environment::{Environment, InjectedFlag, StaticEnvironment};
pub use error::ConnectorError;
pub use injected::InjectedConnector;
pub use local::{LOCAL_WALLET_SLOT, LocalWalletConnector};
pub use qr::{
    InMemoryRelay, PairingApproval, PairingProposal, PairingRelay, PairingUri, QrConnector, build_pairing_uri,
    parse_pairing_uri,
};
pub use session::{ProviderSession, switch_chain_with_fallback};
pub use wrapper::{SafeConfig, SmartWalletConfig, WrapperConfig, WrapperConnector, WrapperKind, WrapperProvider};

/// Parameters for [`Connector::connect`]. Fields a wallet kind does not use
/// are ignored by it.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub chain_id: Option<ChainId>,
    /// Reconnect without prompting (`eth_accounts` instead of
    /// `eth_requestAccounts`); fails with `NotAuthorized` if a prompt would be needed.
    pub silent: bool,
    pub password: Option<String>,
    pub email: Option<String>,
    pub otp: Option<String>,
    pub safe_address: Option<Address>,
}

impl ConnectParams {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_chain(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub qr_pairing: bool,
    pub wrapper: Option<WrapperKind>,
    pub add_chain: bool,
    pub otp_login: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    AccountChanged(Address),
    ChainChanged(ChainId),
    Disconnected,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    async fn connect(&self, params: ConnectParams) -> Result<Address, ConnectorError>;
    /// Idempotent. Also cancels a connect that is still waiting on the wallet.
    async fn disconnect(&self) -> Result<(), ConnectorError>;

    async fn address(&self) -> Result<Address, ConnectorError>;
    async fn chain_id(&self) -> Result<ChainId, ConnectorError>;
    async fn provider(&self) -> Result<Arc<dyn Eip1193Provider>, ConnectorError>;
    async fn signer(&self) -> Result<Arc<dyn MessageSigner>, ConnectorError>;
    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ConnectorError>;

    async fn is_connected(&self) -> bool;
    async fn is_authorized(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent>;
    /// Provider listeners currently attached by this connector.
    fn listener_count(&self) -> usize;

    fn as_pairing(&self) -> Option<&dyn QrPairing> {
        None
    }

    fn as_wrapper(&self) -> Option<&dyn WrapperWallet> {
        None
    }

    fn as_otp(&self) -> Option<&dyn OtpLogin> {
        None
    }
}

/// Out-of-band approval: the URI is shown as a QR code and `connect` resolves
/// once the remote wallet approves it.
#[async_trait]
pub trait QrPairing: Send + Sync {
    async fn pairing_uri(&self, chain_id: Option<ChainId>) -> Result<String, ConnectorError>;
}

/// Wallets whose account is a contract controlled by a personal wallet.
pub trait WrapperWallet: Send + Sync {
    fn wrapper_kind(&self) -> WrapperKind;
    /// Returns the personal wallet this one replaces.
    fn set_personal_wallet(&self, personal: Arc<dyn Connector>) -> Option<Arc<dyn Connector>>;
    fn personal_wallet(&self) -> Option<Arc<dyn Connector>>;
}

#[async_trait]
pub trait OtpLogin: Send + Sync {
    async fn send_otp(&self, email: &str) -> Result<(), ConnectorError>;
}
