use alloy_primitives::Address;
use ck_api_types::ChainId;
use ck_provider::{
    ChainRegistry, Eip1193Provider, ListenerId, MessageSigner, ProviderEvent, ProviderEventKind, ProviderSigner,
    RpcRequest, methods,
};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{ConnectorError, ConnectorEvent};

const EVENT_CAPACITY: usize = 32;
const WATCHED_EVENTS: [ProviderEventKind; 3] = [
    ProviderEventKind::AccountsChanged,
    ProviderEventKind::ChainChanged,
    ProviderEventKind::Disconnect,
];

#[derive(Default)]
struct SessionState {
    generation: u64,
    provider: Option<Arc<dyn Eip1193Provider>>,
    attached: Vec<ListenerId>,
    account: Option<Address>,
    chain_id: Option<ChainId>,
    signer: Option<Arc<dyn MessageSigner>>,
}

struct Shared {
    label: String,
    state: Mutex<SessionState>,
    events: broadcast::Sender<ConnectorEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, event: &ProviderEvent) {
        match event {
            ProviderEvent::AccountsChanged(accounts) => match accounts.first() {
                Some(account) => {
                    let changed = {
                        let mut state = self.lock();
                        let changed = state.account != Some(*account);
                        state.account = Some(*account);
                        state.signer = None;
                        changed
                    };
                    if changed {
                        let _ = self.events.send(ConnectorEvent::AccountChanged(*account));
                    }
                }
                None => {
                    debug!(connector = %self.label, "wallet reported no accounts");
                    self.teardown();
                }
            },
            ProviderEvent::ChainChanged(chain_id) => self.set_chain_id(*chain_id),
            ProviderEvent::Disconnect(reason) => {
                debug!(connector = %self.label, %reason, "provider disconnected");
                self.teardown();
            }
        }
    }

    fn set_chain_id(&self, chain_id: ChainId) {
        let changed = {
            let mut state = self.lock();
            if state.account.is_none() {
                return;
            }
            let changed = state.chain_id != Some(chain_id);
            state.chain_id = Some(chain_id);
            changed
        };
        if changed {
            let _ = self.events.send(ConnectorEvent::ChainChanged(chain_id));
        }
    }

    fn teardown(&self) -> bool {
        let (provider, attached, was_connected) = {
            let mut state = self.lock();
            state.generation += 1;
            let attached = std::mem::take(&mut state.attached);
            let provider = state.provider.take();
            let was_connected = state.account.take().is_some();
            state.chain_id = None;
            state.signer = None;
            (provider, attached, was_connected)
        };

        if let Some(provider) = provider {
            for id in &attached {
                provider.remove_listener(*id);
            }
        }
        if !attached.is_empty() {
            debug!(connector = %self.label, count = attached.len(), "provider listeners detached");
        }
        if was_connected {
            info!(connector = %self.label, "disconnected");
            let _ = self.events.send(ConnectorEvent::Disconnected);
        }
        was_connected
    }
}

/// Connection state of one connector: the provider handle, the listeners
/// attached to it, and the account/chain they keep current.
///
/// A generation counter is bumped on every teardown. A connect captures it
/// with [`begin`](Self::begin) before waiting on the wallet and hands it back
/// to [`establish`](Self::establish); if a disconnect happened in between the
/// result is refused and nothing is attached.
pub struct ProviderSession {
    shared: Arc<Shared>,
}

impl ProviderSession {
    pub fn new(label: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                state: Mutex::new(SessionState::default()),
                events,
            }),
        }
    }

    pub fn begin(&self) -> u64 {
        self.shared.lock().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.shared.lock().generation == generation
    }

    pub fn establish(
        &self,
        generation: u64,
        provider: Arc<dyn Eip1193Provider>,
        account: Address,
        chain_id: ChainId,
    ) -> Result<(), ConnectorError> {
        let (stale, previous) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.generation != generation {
                debug!(connector = %self.shared.label, "connect finished after disconnect; dropping result");
                return Err(ConnectorError::Cancelled);
            }

            let stale = match &state.provider {
                Some(current) if !same_provider(current, &provider) => {
                    Some((current.clone(), std::mem::take(&mut state.attached)))
                }
                _ => None,
            };

            state.provider = Some(provider);
            let previous = state.account.replace(account);
            state.chain_id = Some(chain_id);
            state.signer = None;
            self.attach_locked(state);
            (stale, previous)
        };

        if let Some((old, ids)) = stale {
            for id in ids {
                old.remove_listener(id);
            }
        }
        if previous.is_some_and(|previous| previous != account) {
            let _ = self.shared.events.send(ConnectorEvent::AccountChanged(account));
        }

        info!(connector = %self.shared.label, %account, chain_id = %chain_id, "connected");
        Ok(())
    }

    fn attach_locked(&self, state: &mut SessionState) -> usize {
        if !state.attached.is_empty() {
            return 0;
        }
        let Some(provider) = state.provider.clone() else {
            return 0;
        };

        for kind in WATCHED_EVENTS {
            let weak = Arc::downgrade(&self.shared);
            let id = provider.on(
                kind,
                Arc::new(move |event| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle(event);
                    }
                }),
            );
            state.attached.push(id);
        }
        debug!(connector = %self.shared.label, "provider listeners attached");
        WATCHED_EVENTS.len()
    }

    /// Attaches the event listeners if they are not attached yet. Returns how
    /// many were added.
    pub fn attach(&self) -> usize {
        let mut state = self.shared.lock();
        self.attach_locked(&mut state)
    }

    /// Removes exactly the listeners this session attached, keeping the
    /// connection itself. Returns how many were removed.
    pub fn detach(&self) -> usize {
        let (provider, ids) = {
            let mut state = self.shared.lock();
            (state.provider.clone(), std::mem::take(&mut state.attached))
        };
        if let Some(provider) = provider {
            for id in &ids {
                provider.remove_listener(*id);
            }
        }
        ids.len()
    }

    /// Clears the connection and detaches listeners. Returns whether a
    /// connection existed.
    pub fn teardown(&self) -> bool {
        self.shared.teardown()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().account.is_some()
    }

    pub fn account(&self) -> Result<Address, ConnectorError> {
        self.shared.lock().account.ok_or(ConnectorError::NotConnected)
    }

    pub fn chain_id(&self) -> Result<ChainId, ConnectorError> {
        self.shared.lock().chain_id.ok_or(ConnectorError::NotConnected)
    }

    pub fn set_chain_id(&self, chain_id: ChainId) {
        self.shared.set_chain_id(chain_id);
    }

    pub fn provider(&self) -> Result<Arc<dyn Eip1193Provider>, ConnectorError> {
        self.shared.lock().provider.clone().ok_or(ConnectorError::NotConnected)
    }

    /// Built on first use and cached until the account changes.
    pub fn signer(&self) -> Result<Arc<dyn MessageSigner>, ConnectorError> {
        let mut state = self.shared.lock();
        if let Some(signer) = &state.signer {
            return Ok(signer.clone());
        }
        let provider = state.provider.clone().ok_or(ConnectorError::NotConnected)?;
        let account = state.account.ok_or(ConnectorError::NotConnected)?;
        let signer: Arc<dyn MessageSigner> = Arc::new(ProviderSigner::new(provider, account));
        state.signer = Some(signer.clone());
        Ok(signer)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.shared.events.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.lock().attached.len()
    }
}

fn same_provider(a: &Arc<dyn Eip1193Provider>, b: &Arc<dyn Eip1193Provider>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// `wallet_switchEthereumChain`, adding the chain first when the wallet does
/// not know it (error 4902) and the app has its parameters.
pub async fn switch_chain_with_fallback(
    provider: &dyn Eip1193Provider,
    chain_id: ChainId,
    chains: &ChainRegistry,
    add_chain_supported: bool,
) -> Result<(), ConnectorError> {
    let switch = RpcRequest::new(methods::WALLET_SWITCH_CHAIN, json!([{ "chainId": chain_id.to_hex() }]));
    let err = match provider.request(switch.clone()).await {
        Ok(_) => return Ok(()),
        Err(err) if err.is_unrecognized_chain() => err,
        Err(err) => return Err(err.into()),
    };

    let Some(chain) = chains.chain(chain_id) else {
        return Err(ConnectorError::ChainNotConfigured {
            chain_id,
            reason: format!("not in the app chain list ({err})"),
        });
    };
    if !add_chain_supported {
        return Err(ConnectorError::ChainNotConfigured {
            chain_id,
            reason: "wallet cannot add chains".to_owned(),
        });
    }

    info!(chain_id = %chain_id, name = %chain.name, "wallet does not know chain; adding it");
    let add = RpcRequest::new(methods::WALLET_ADD_CHAIN, json!([chain.add_chain_parameter()]));
    provider.request(add).await.map_err(|add_err| {
        if add_err.is_user_rejected() {
            ConnectorError::UserRejected
        } else {
            ConnectorError::ChainNotConfigured {
                chain_id,
                reason: add_err.to_string(),
            }
        }
    })?;

    provider.request(switch).await?;
    Ok(())
}
