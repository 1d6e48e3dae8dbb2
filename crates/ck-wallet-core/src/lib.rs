//! Wallet selection and connection flow: the registry of wallets an app
//! offers, the connect modal state machine driving them, render-ready screen
//! models, and the session that publishes the connected account.

mod autoconnect;
mod config;
mod modal;
mod registry;
mod screens;
mod session;
mod signature;

#[cfg(test)]
mod testing;

pub use autoconnect::auto_connect;
pub use config::ConnectConfig;
pub use modal::{ConnectModal, ModalError, ModalEvent, Screen, SelectOutcome};
pub use registry::{
    ConnectorFactory, CreateOptions, RegistryError, WalletDescriptor, WalletInfo, WalletKind, WalletRegistry,
};
pub use screens::{ActionKind, DownloadLink, FieldKind, FormField, ScreenAction, ScreenView, WalletItem, render};
pub use session::{AccountSnapshot, ConnectionSession};
pub use signature::{SignatureError, SignatureFlow, SignatureStatus};
