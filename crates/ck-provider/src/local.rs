use alloy_primitives::hex;
use async_trait::async_trait;
use ck_api_types::{AddEthereumChainParameter, ChainId};
use ck_crypto::LocalSigner;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::{
    EventEmitter, Eip1193Provider, Listener, ListenerId, ProviderError, ProviderEvent, ProviderEventKind, RpcRequest,
    methods, parse_chain_id,
};

/// How the simulated wallet answers `eth_requestAccounts`. `Reject` also
/// refuses signing prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    Auto,
    Reject,
    Delay(Duration),
    /// Never answers, like a wallet popup the user walked away from.
    Pending,
}

struct LocalState {
    chain_id: ChainId,
    known_chains: BTreeSet<ChainId>,
    authorized: bool,
    approval: Approval,
    requests: Vec<String>,
}

/// In-process EIP-1193 wallet backed by a [`LocalSigner`].
///
/// Guest wallets use it as their real provider; hosts without a browser use
/// it to stand in for an injected extension.
pub struct LocalProvider {
    signer: Arc<LocalSigner>,
    state: Mutex<LocalState>,
    add_chain_supported: bool,
    upstream: Option<Arc<dyn Eip1193Provider>>,
    emitter: EventEmitter,
}

pub struct LocalProviderBuilder {
    signer: Arc<LocalSigner>,
    chain_id: ChainId,
    known_chains: BTreeSet<ChainId>,
    authorized: bool,
    approval: Approval,
    add_chain_supported: bool,
    upstream: Option<Arc<dyn Eip1193Provider>>,
}

impl LocalProviderBuilder {
    #[must_use]
    pub fn chain(mut self, chain_id: ChainId) -> Self {
        self.chain_id = chain_id;
        self.known_chains.insert(chain_id);
        self
    }

    #[must_use]
    pub fn known_chains(mut self, chains: impl IntoIterator<Item = ChainId>) -> Self {
        self.known_chains.extend(chains);
        self
    }

    #[must_use]
    pub fn approval(mut self, approval: Approval) -> Self {
        self.approval = approval;
        self
    }

    #[must_use]
    pub fn authorized(mut self, authorized: bool) -> Self {
        self.authorized = authorized;
        self
    }

    #[must_use]
    pub fn add_chain_supported(mut self, supported: bool) -> Self {
        self.add_chain_supported = supported;
        self
    }

    #[must_use]
    pub fn upstream(mut self, upstream: Arc<dyn Eip1193Provider>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn build(self) -> LocalProvider {
        LocalProvider {
            signer: self.signer,
            state: Mutex::new(LocalState {
                chain_id: self.chain_id,
                known_chains: self.known_chains,
                authorized: self.authorized,
                approval: self.approval,
                requests: Vec::new(),
            }),
            add_chain_supported: self.add_chain_supported,
            upstream: self.upstream,
            emitter: EventEmitter::default(),
        }
    }
}

impl LocalProvider {
    pub fn builder(signer: Arc<LocalSigner>) -> LocalProviderBuilder {
        let mut known_chains = BTreeSet::new();
        known_chains.insert(ChainId::MAINNET);
        LocalProviderBuilder {
            signer,
            chain_id: ChainId::MAINNET,
            known_chains,
            authorized: false,
            approval: Approval::Auto,
            add_chain_supported: true,
            upstream: None,
        }
    }

    pub fn signer(&self) -> &Arc<LocalSigner> {
        &self.signer
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_approval(&self, approval: Approval) {
        self.state().approval = approval;
    }

    pub fn chain_id(&self) -> ChainId {
        self.state().chain_id
    }

    pub fn knows_chain(&self, chain_id: ChainId) -> bool {
        self.state().known_chains.contains(&chain_id)
    }

    /// Methods received so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    pub fn count_requests(&self, method: &str) -> usize {
        self.state().requests.iter().filter(|entry| entry.as_str() == method).count()
    }

    /// Simulates the user locking the wallet.
    pub fn lock_wallet(&self) {
        self.state().authorized = false;
        self.emitter.emit(&ProviderEvent::AccountsChanged(Vec::new()));
    }

    /// Simulates the user switching network from inside the wallet.
    pub fn change_chain(&self, chain_id: ChainId) {
        {
            let mut state = self.state();
            state.known_chains.insert(chain_id);
            state.chain_id = chain_id;
        }
        self.emitter.emit(&ProviderEvent::ChainChanged(chain_id));
    }

    pub fn emit_disconnect(&self) {
        self.state().authorized = false;
        self.emitter.emit(&ProviderEvent::Disconnect(ProviderError::disconnected()));
    }

    fn accounts_value(&self) -> Value {
        json!([self.signer.address().to_checksum(None)])
    }

    async fn await_approval(&self) -> Result<(), ProviderError> {
        let approval = self.state().approval;
        match approval {
            Approval::Auto => {}
            Approval::Reject => return Err(ProviderError::user_rejected()),
            Approval::Delay(delay) => tokio::time::sleep(delay).await,
            Approval::Pending => std::future::pending::<()>().await,
        }
        self.state().authorized = true;
        Ok(())
    }

    fn switch_chain(&self, params: &Value) -> Result<Value, ProviderError> {
        let raw = params
            .get(0)
            .and_then(|entry| entry.get("chainId"))
            .ok_or_else(|| ProviderError::invalid_params("missing chainId"))?;
        let target = parse_chain_id(raw)?;

        let changed = {
            let mut state = self.state();
            if !state.known_chains.contains(&target) {
                return Err(ProviderError::unrecognized_chain(target));
            }
            let changed = state.chain_id != target;
            state.chain_id = target;
            changed
        };

        if changed {
            self.emitter.emit(&ProviderEvent::ChainChanged(target));
        }
        Ok(Value::Null)
    }

    fn add_chain(&self, params: &Value) -> Result<Value, ProviderError> {
        if !self.add_chain_supported {
            return Err(ProviderError::unsupported_method(methods::WALLET_ADD_CHAIN));
        }

        let parameter: AddEthereumChainParameter = params
            .get(0)
            .cloned()
            .ok_or_else(|| ProviderError::invalid_params("missing chain parameter"))
            .and_then(|raw| {
                serde_json::from_value(raw).map_err(|err| ProviderError::invalid_params(err.to_string()))
            })?;
        let chain_id = ChainId::from_hex(&parameter.chain_id)
            .ok_or_else(|| ProviderError::invalid_params(format!("invalid chainId {}", parameter.chain_id)))?;

        self.state().known_chains.insert(chain_id);
        debug!(chain_id = %chain_id, name = %parameter.chain_name, "chain added to local wallet");
        Ok(Value::Null)
    }

    fn personal_sign(&self, params: &Value) -> Result<Value, ProviderError> {
        {
            let state = self.state();
            if !state.authorized {
                return Err(ProviderError::unauthorized());
            }
            if state.approval == Approval::Reject {
                return Err(ProviderError::user_rejected());
            }
        }

        let data = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_params("missing message"))?;
        let address = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_params("missing address"))?;

        if !address.eq_ignore_ascii_case(&self.signer.address().to_checksum(None)) {
            return Err(ProviderError::unauthorized());
        }

        let message = hex::decode(data).map_err(|err| ProviderError::invalid_params(err.to_string()))?;
        let signature = self
            .signer
            .sign_message(&message)
            .map_err(|err| ProviderError::internal(err.to_string()))?;
        Ok(Value::String(hex::encode_prefixed(signature)))
    }
}

#[async_trait]
impl Eip1193Provider for LocalProvider {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        self.state().requests.push(request.method.clone());

        match request.method.as_str() {
            methods::ETH_REQUEST_ACCOUNTS => {
                if !self.state().authorized {
                    self.await_approval().await?;
                }
                Ok(self.accounts_value())
            }
            methods::ETH_ACCOUNTS => {
                if self.state().authorized {
                    Ok(self.accounts_value())
                } else {
                    Ok(json!([]))
                }
            }
            methods::ETH_CHAIN_ID => Ok(Value::String(self.chain_id().to_hex())),
            methods::NET_VERSION => Ok(Value::String(self.chain_id().to_string())),
            methods::WALLET_SWITCH_CHAIN => self.switch_chain(&request.params),
            methods::WALLET_ADD_CHAIN => self.add_chain(&request.params),
            methods::WALLET_WATCH_ASSET => Ok(Value::Bool(true)),
            methods::PERSONAL_SIGN => self.personal_sign(&request.params),
            other => match &self.upstream {
                Some(upstream) => upstream.request(request).await,
                None => Err(ProviderError::unsupported_method(other)),
            },
        }
    }

    fn on(&self, kind: ProviderEventKind, listener: Listener) -> ListenerId {
        self.emitter.on(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.emitter.remove(id)
    }

    fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }
}
