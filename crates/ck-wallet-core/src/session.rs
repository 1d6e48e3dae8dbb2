use alloy_primitives::Address;
use ck_api_types::{ChainId, WalletId};
use ck_auth_adapter::epoch_ms;
use ck_connectors::{Connector, ConnectorError, ConnectorEvent};
use ck_storage::{LastConnectedRecord, SessionStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The account the app is connected with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub wallet_id: WalletId,
    pub address: Address,
    pub chain_id: ChainId,
}

struct ActiveConnection {
    wallet_id: WalletId,
    connector: Arc<dyn Connector>,
    forwarder: JoinHandle<()>,
    activation: u64,
}

struct SessionInner {
    store: Arc<dyn SessionStore>,
    account: watch::Sender<Option<AccountSnapshot>>,
    active: Mutex<Option<ActiveConnection>>,
    activations: AtomicU64,
}

impl SessionInner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, activation: u64) -> bool {
        self.active().as_ref().is_some_and(|active| active.activation == activation)
    }

    fn update(&self, activation: u64, apply: impl FnOnce(&mut AccountSnapshot)) -> Option<AccountSnapshot> {
        if !self.is_current(activation) {
            return None;
        }
        let mut updated = None;
        self.account.send_modify(|account| {
            if let Some(snapshot) = account.as_mut() {
                apply(snapshot);
                updated = Some(snapshot.clone());
            }
        });
        updated
    }

    async fn save(&self, snapshot: &AccountSnapshot) {
        let record = LastConnectedRecord {
            wallet_id: snapshot.wallet_id.to_string(),
            chain_id: snapshot.chain_id.0,
            connected_at_epoch_ms: epoch_ms().unwrap_or_default(),
        };
        if let Err(err) = self.store.save_last_connected(&record).await {
            warn!(error = %err, "failed to persist last connected wallet");
        }
    }

    async fn clear(&self) {
        if let Err(err) = self.store.clear_last_connected().await {
            warn!(error = %err, "failed to clear last connected wallet");
        }
    }
}

/// Holds the one active connector of an app and publishes its account.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl ConnectionSession {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (account, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                store,
                account,
                active: Mutex::new(None),
                activations: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub fn account(&self) -> Option<AccountSnapshot> {
        self.inner.account.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<AccountSnapshot>> {
        self.inner.account.subscribe()
    }

    pub fn active_connector(&self) -> Option<Arc<dyn Connector>> {
        self.inner.active().as_ref().map(|active| active.connector.clone())
    }

    pub fn active_wallet(&self) -> Option<WalletId> {
        self.inner.active().as_ref().map(|active| active.wallet_id.clone())
    }

    /// Makes `connector` the active connection. A different connector that
    /// was active before is disconnected.
    pub async fn activate(
        &self,
        wallet_id: WalletId,
        connector: Arc<dyn Connector>,
    ) -> Result<AccountSnapshot, ConnectorError> {
        let snapshot = AccountSnapshot {
            wallet_id: wallet_id.clone(),
            address: connector.address().await?,
            chain_id: connector.chain_id().await?,
        };

        let activation = self.inner.activations.fetch_add(1, Ordering::SeqCst) + 1;
        let events = connector.subscribe();
        let forwarder = tokio::spawn(forward_events(Arc::downgrade(&self.inner), activation, events));

        let previous = self.inner.active().replace(ActiveConnection {
            wallet_id: wallet_id.clone(),
            connector: connector.clone(),
            forwarder,
            activation,
        });
        self.inner.account.send_replace(Some(snapshot.clone()));

        if let Some(previous) = previous {
            previous.forwarder.abort();
            // A wrapper keeps its personal wallet alive.
            let owner = connector.as_wrapper().and_then(|wrapper| wrapper.personal_wallet());
            let kept = same_connector(&previous.connector, &connector)
                || owner.is_some_and(|owner| same_connector(&owner, &previous.connector));
            if !kept {
                debug!(previous = %previous.wallet_id, next = %wallet_id, "replacing active connector");
                if let Err(err) = previous.connector.disconnect().await {
                    warn!(wallet = %previous.wallet_id, error = %err, "previous connector failed to disconnect");
                }
            }
        }

        self.inner.save(&snapshot).await;
        info!(wallet = %wallet_id, address = %snapshot.address, chain_id = %snapshot.chain_id, "account connected");
        Ok(snapshot)
    }

    /// Disconnects the active connector, if any, and forgets it.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let active = self.inner.active().take();
        self.inner.account.send_replace(None);
        self.inner.clear().await;

        let Some(active) = active else {
            return Ok(());
        };
        active.forwarder.abort();
        info!(wallet = %active.wallet_id, "account disconnected");
        active.connector.disconnect().await
    }

    pub async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ConnectorError> {
        let (connector, activation) = {
            let active = self.inner.active();
            let active = active.as_ref().ok_or(ConnectorError::NotConnected)?;
            (active.connector.clone(), active.activation)
        };
        connector.switch_chain(chain_id).await?;
        if let Some(snapshot) = self.inner.update(activation, |snapshot| snapshot.chain_id = chain_id) {
            self.inner.save(&snapshot).await;
        }
        Ok(())
    }
}

pub(crate) fn same_connector(a: &Arc<dyn Connector>, b: &Arc<dyn Connector>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

async fn forward_events(
    session: Weak<SessionInner>,
    activation: u64,
    mut events: broadcast::Receiver<ConnectorEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "connector events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = session.upgrade() else {
            break;
        };

        match event {
            ConnectorEvent::AccountChanged(address) => {
                if let Some(snapshot) = inner.update(activation, |snapshot| snapshot.address = address) {
                    debug!(wallet = %snapshot.wallet_id, %address, "account changed");
                }
            }
            ConnectorEvent::ChainChanged(chain_id) => {
                if let Some(snapshot) = inner.update(activation, |snapshot| snapshot.chain_id = chain_id) {
                    debug!(wallet = %snapshot.wallet_id, %chain_id, "chain changed");
                    inner.save(&snapshot).await;
                }
            }
            ConnectorEvent::Disconnected => {
                let ended = {
                    let mut active = inner.active();
                    if active.as_ref().is_some_and(|active| active.activation == activation) {
                        active.take()
                    } else {
                        None
                    }
                };
                if let Some(ended) = ended {
                    info!(wallet = %ended.wallet_id, "wallet ended the session");
                    inner.account.send_replace(None);
                    inner.clear().await;
                }
                break;
            }
        }
    }
}
