use ck_provider::Eip1193Provider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::ConnectorError;

/// Which injected extension a connector looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectedFlag {
    MetaMask,
    CoinbaseWallet,
    /// Any EIP-1193 provider the host exposes.
    Generic,
}

/// Host probe: what the runtime offers to connectors.
pub trait Environment: Send + Sync {
    fn injected_provider(&self, flag: InjectedFlag) -> Option<Arc<dyn Eip1193Provider>>;
    fn is_mobile(&self) -> bool;
    fn open_url(&self, url: &str) -> Result<(), ConnectorError>;
}

/// Fixed environment assembled by the host at startup.
#[derive(Default)]
pub struct StaticEnvironment {
    injected: HashMap<InjectedFlag, Arc<dyn Eip1193Provider>>,
    mobile: bool,
    opened: Mutex<Vec<String>>,
}

impl StaticEnvironment {
    pub fn new(mobile: bool) -> Self {
        Self {
            mobile,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_injected(mut self, flag: InjectedFlag, provider: Arc<dyn Eip1193Provider>) -> Self {
        self.injected.insert(flag, provider);
        self
    }

    /// URLs handed to [`Environment::open_url`], oldest first.
    pub fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Environment for StaticEnvironment {
    fn injected_provider(&self, flag: InjectedFlag) -> Option<Arc<dyn Eip1193Provider>> {
        self.injected.get(&flag).cloned()
    }

    fn is_mobile(&self) -> bool {
        self.mobile
    }

    fn open_url(&self, url: &str) -> Result<(), ConnectorError> {
        info!(url, "opening url");
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_owned());
        Ok(())
    }
}
