use alloy_primitives::Address;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ck_api_types::{ChainId, DappMetadata};
use ck_provider::{ChainRegistry, Eip1193Provider, MessageSigner, current_chain_id, request_accounts};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    Capabilities, ConnectParams, Connector, ConnectorError, ConnectorEvent, ProviderSession, QrPairing,
    switch_chain_with_fallback,
};

const URI_SCHEME: &str = "ckpair";
const URI_VERSION: u32 = 1;

/// Parsed form of `ckpair:<topic>@1?relay=<url>&key=<base64url>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: String,
    pub relay: String,
    pub key: String,
}

pub fn build_pairing_uri(uri: &PairingUri) -> String {
    format!(
        "{URI_SCHEME}:{}@{URI_VERSION}?relay={}&key={}",
        uri.topic,
        escape_component(&uri.relay),
        uri.key
    )
}

pub fn parse_pairing_uri(raw: &str) -> Result<PairingUri, ConnectorError> {
    let malformed = || ConnectorError::Backend(format!("malformed pairing uri: {raw}"));

    let rest = raw
        .strip_prefix(URI_SCHEME)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(malformed)?;
    let (head, query) = rest.split_once('?').ok_or_else(malformed)?;
    let (topic, version) = head.split_once('@').ok_or_else(malformed)?;
    if topic.is_empty() || version.parse::<u32>().ok() != Some(URI_VERSION) {
        return Err(malformed());
    }

    let mut relay = None;
    let mut key = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("relay", value)) => relay = Some(unescape_component(value)),
            Some(("key", value)) => key = Some(value.to_owned()),
            _ => {}
        }
    }

    let key = key.filter(|key| URL_SAFE_NO_PAD.decode(key).is_ok()).ok_or_else(malformed)?;
    Ok(PairingUri {
        topic: topic.to_owned(),
        relay: relay.ok_or_else(malformed)?,
        key,
    })
}

fn escape_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '?' => out.push_str("%3F"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_component(value: &str) -> String {
    value
        .replace("%3F", "?")
        .replace("%3D", "=")
        .replace("%26", "&")
        .replace("%25", "%")
}

/// Fresh pairing key: 32 random bytes, base64url without padding.
pub(crate) fn generate_pairing_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingProposal {
    pub topic: String,
    pub key: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingApproval {
    pub accounts: Vec<Address>,
    pub chain_id: ChainId,
}

/// Transport between the app and a wallet on another device.
#[async_trait]
pub trait PairingRelay: Send + Sync {
    async fn propose(&self, dapp: &DappMetadata, chain_id: ChainId) -> Result<PairingProposal, ConnectorError>;
    /// Resolves when the wallet approves or rejects, or the pairing is cancelled or expires.
    async fn wait_for_approval(&self, proposal: &PairingProposal) -> Result<PairingApproval, ConnectorError>;
    async fn cancel(&self, proposal: &PairingProposal) -> Result<(), ConnectorError>;
    /// Provider that forwards requests to the paired wallet.
    async fn session_provider(
        &self,
        proposal: &PairingProposal,
        approval: &PairingApproval,
    ) -> Result<Arc<dyn Eip1193Provider>, ConnectorError>;
}

#[derive(Debug, Clone)]
enum PairingState {
    Pending,
    Approved(PairingApproval),
    Rejected(String),
    Cancelled,
}

struct RelayEntry {
    key: String,
    dapp: DappMetadata,
    chain_id: ChainId,
    state: watch::Sender<PairingState>,
    wallet: Option<Arc<dyn Eip1193Provider>>,
}

/// Relay that lives in the same process as both sides of the pairing.
/// The wallet side calls [`approve`](Self::approve) with the scanned URI.
pub struct InMemoryRelay {
    relay_url: String,
    entries: Mutex<HashMap<String, RelayEntry>>,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new("memory://relay")
    }
}

impl InMemoryRelay {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RelayEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_key(&self, uri: &PairingUri) -> Result<(), ConnectorError> {
        let entries = self.entries();
        let entry = entries
            .get(&uri.topic)
            .ok_or_else(|| ConnectorError::Backend(format!("unknown pairing topic {}", uri.topic)))?;
        if entry.key != uri.key {
            return Err(ConnectorError::Backend("pairing key mismatch".to_owned()));
        }
        if !matches!(*entry.state.borrow(), PairingState::Pending) {
            return Err(ConnectorError::Backend(format!("pairing {} is no longer pending", uri.topic)));
        }
        Ok(())
    }

    /// Wallet side: asks `wallet` for its accounts and hands them to the app.
    pub async fn approve(
        &self,
        raw_uri: &str,
        wallet: Arc<dyn Eip1193Provider>,
    ) -> Result<PairingApproval, ConnectorError> {
        let uri = parse_pairing_uri(raw_uri)?;
        self.check_key(&uri)?;

        let accounts = request_accounts(wallet.as_ref(), false).await?;
        if accounts.is_empty() {
            return Err(ConnectorError::NotAuthorized);
        }
        let chain_id = current_chain_id(wallet.as_ref()).await?;
        let approval = PairingApproval { accounts, chain_id };

        let mut entries = self.entries();
        let entry = entries
            .get_mut(&uri.topic)
            .ok_or_else(|| ConnectorError::Backend(format!("pairing {} was cancelled", uri.topic)))?;
        entry.wallet = Some(wallet);
        entry.state.send_replace(PairingState::Approved(approval.clone()));
        info!(topic = %uri.topic, dapp = %entry.dapp.name, "pairing approved");
        Ok(approval)
    }

    pub fn reject(&self, raw_uri: &str, reason: &str) -> Result<(), ConnectorError> {
        let uri = parse_pairing_uri(raw_uri)?;
        self.check_key(&uri)?;
        if let Some(entry) = self.entries().get(&uri.topic) {
            entry.state.send_replace(PairingState::Rejected(reason.to_owned()));
        }
        info!(topic = %uri.topic, reason, "pairing rejected");
        Ok(())
    }

    /// Topics still waiting for a wallet.
    pub fn pending_pairings(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, entry)| matches!(*entry.state.borrow(), PairingState::Pending))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Chain the app asked for when it proposed `topic`.
    pub fn requested_chain(&self, topic: &str) -> Option<ChainId> {
        self.entries().get(topic).map(|entry| entry.chain_id)
    }
}

#[async_trait]
impl PairingRelay for InMemoryRelay {
    async fn propose(&self, dapp: &DappMetadata, chain_id: ChainId) -> Result<PairingProposal, ConnectorError> {
        let topic = uuid::Uuid::new_v4().simple().to_string();
        let key = generate_pairing_key();
        let uri = build_pairing_uri(&PairingUri {
            topic: topic.clone(),
            relay: self.relay_url.clone(),
            key: key.clone(),
        });

        let (state, _) = watch::channel(PairingState::Pending);
        self.entries().insert(
            topic.clone(),
            RelayEntry {
                key: key.clone(),
                dapp: dapp.clone(),
                chain_id,
                state,
                wallet: None,
            },
        );
        debug!(%topic, "pairing proposed");
        Ok(PairingProposal { topic, key, uri })
    }

    async fn wait_for_approval(&self, proposal: &PairingProposal) -> Result<PairingApproval, ConnectorError> {
        let mut state = self
            .entries()
            .get(&proposal.topic)
            .map(|entry| entry.state.subscribe())
            .ok_or_else(|| ConnectorError::Backend(format!("unknown pairing topic {}", proposal.topic)))?;

        let settled = state
            .wait_for(|state| !matches!(state, PairingState::Pending))
            .await
            .map(|state| (*state).clone())
            .map_err(|_| ConnectorError::Cancelled)?;

        match settled {
            PairingState::Approved(approval) => Ok(approval),
            PairingState::Rejected(reason) => {
                debug!(topic = %proposal.topic, %reason, "wallet rejected pairing");
                Err(ConnectorError::UserRejected)
            }
            PairingState::Pending | PairingState::Cancelled => Err(ConnectorError::Cancelled),
        }
    }

    async fn cancel(&self, proposal: &PairingProposal) -> Result<(), ConnectorError> {
        if let Some(entry) = self.entries().remove(&proposal.topic) {
            entry.state.send_replace(PairingState::Cancelled);
            debug!(topic = %proposal.topic, "pairing cancelled");
        }
        Ok(())
    }

    async fn session_provider(
        &self,
        proposal: &PairingProposal,
        _approval: &PairingApproval,
    ) -> Result<Arc<dyn Eip1193Provider>, ConnectorError> {
        self.entries()
            .get(&proposal.topic)
            .and_then(|entry| entry.wallet.clone())
            .ok_or(ConnectorError::NotConnected)
    }
}

struct PendingPairing {
    proposal: PairingProposal,
    cancel: watch::Sender<bool>,
}

/// Wallet on another device, paired by scanning a URI.
pub struct QrConnector {
    id: String,
    relay: Arc<dyn PairingRelay>,
    dapp: DappMetadata,
    chains: ChainRegistry,
    default_chain: ChainId,
    pending: Mutex<Option<PendingPairing>>,
    active: Mutex<Option<PairingProposal>>,
    session: ProviderSession,
}

impl QrConnector {
    pub fn new(
        id: impl Into<String>,
        relay: Arc<dyn PairingRelay>,
        dapp: DappMetadata,
        chains: ChainRegistry,
        default_chain: ChainId,
    ) -> Self {
        let id = id.into();
        Self {
            session: ProviderSession::new(id.clone()),
            id,
            relay,
            dapp,
            chains,
            default_chain,
            pending: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingPairing>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, Option<PairingProposal>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the outstanding proposal, creating one if there is none.
    async fn ensure_proposal(
        &self,
        chain_id: ChainId,
    ) -> Result<(PairingProposal, watch::Receiver<bool>), ConnectorError> {
        let existing = self
            .pending()
            .as_ref()
            .map(|pending| (pending.proposal.clone(), pending.cancel.subscribe()));
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let proposal = self.relay.propose(&self.dapp, chain_id).await?;
        let (outcome, duplicate) = {
            let mut pending = self.pending();
            match pending.as_ref() {
                Some(existing) => (
                    (existing.proposal.clone(), existing.cancel.subscribe()),
                    Some(proposal),
                ),
                None => {
                    let (cancel, receiver) = watch::channel(false);
                    *pending = Some(PendingPairing {
                        proposal: proposal.clone(),
                        cancel,
                    });
                    ((proposal, receiver), None)
                }
            }
        };

        if let Some(duplicate) = duplicate {
            self.relay.cancel(&duplicate).await?;
        }
        Ok(outcome)
    }

    fn clear_pending(&self, topic: &str) {
        let mut pending = self.pending();
        if pending.as_ref().is_some_and(|p| p.proposal.topic == topic) {
            *pending = None;
        }
    }

    async fn open_session(
        &self,
        generation: u64,
        proposal: &PairingProposal,
        approval: PairingApproval,
        target: Option<ChainId>,
    ) -> Result<Address, ConnectorError> {
        let account = *approval.accounts.first().ok_or(ConnectorError::NotAuthorized)?;
        let provider = self.relay.session_provider(proposal, &approval).await?;

        let mut chain_id = approval.chain_id;
        if let Some(target) = target.filter(|target| *target != chain_id) {
            switch_chain_with_fallback(provider.as_ref(), target, &self.chains, true).await?;
            chain_id = target;
        }

        self.session.establish(generation, provider, account, chain_id)?;
        Ok(account)
    }

    async fn close_pairing(&self, proposal: &PairingProposal) {
        if let Err(err) = self.relay.cancel(proposal).await {
            warn!(connector = %self.id, topic = %proposal.topic, error = %err, "failed to close paired session");
        }
    }
}

#[async_trait]
impl QrPairing for QrConnector {
    async fn pairing_uri(&self, chain_id: Option<ChainId>) -> Result<String, ConnectorError> {
        let (proposal, _) = self.ensure_proposal(chain_id.unwrap_or(self.default_chain)).await?;
        Ok(proposal.uri)
    }
}

#[async_trait]
impl Connector for QrConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            qr_pairing: true,
            add_chain: true,
            ..Capabilities::default()
        }
    }

    async fn connect(&self, params: ConnectParams) -> Result<Address, ConnectorError> {
        if params.silent {
            return Err(ConnectorError::NotAuthorized);
        }

        let generation = self.session.begin();
        let requested = params.chain_id.unwrap_or(self.default_chain);
        let (proposal, mut cancelled) = self.ensure_proposal(requested).await?;
        debug!(connector = %self.id, topic = %proposal.topic, "waiting for wallet to scan");

        let result = tokio::select! {
            result = self.relay.wait_for_approval(&proposal) => result,
            Ok(_) = cancelled.wait_for(|cancelled| *cancelled) => Err(ConnectorError::Cancelled),
        };
        // Tracked as active before it leaves pending, so a disconnect at any
        // point closes it.
        let replaced = match &result {
            Ok(_) => self.active().replace(proposal.clone()),
            Err(_) => None,
        };
        self.clear_pending(&proposal.topic);
        let approval = result?;

        match self.open_session(generation, &proposal, approval, params.chain_id).await {
            Ok(account) => {
                if let Some(replaced) = replaced {
                    debug!(connector = %self.id, topic = %replaced.topic, "closing replaced pairing");
                    self.close_pairing(&replaced).await;
                }
                Ok(account)
            }
            Err(err) => {
                let live = self.session.is_connected();
                let orphan = {
                    let mut active = self.active();
                    let ours = active.as_ref().is_some_and(|active| active.topic == proposal.topic);
                    match replaced {
                        Some(replaced) if ours && live => {
                            *active = Some(replaced);
                            None
                        }
                        replaced => {
                            if ours {
                                *active = None;
                            }
                            replaced
                        }
                    }
                };
                self.close_pairing(&proposal).await;
                if let Some(orphan) = orphan {
                    self.close_pairing(&orphan).await;
                }
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        let pending = self.pending().take();
        if let Some(pending) = pending {
            pending.cancel.send_replace(true);
            if let Err(err) = self.relay.cancel(&pending.proposal).await {
                warn!(connector = %self.id, error = %err, "failed to cancel pending pairing");
            }
        }

        self.session.teardown();

        let active = self.active().take();
        if let Some(active) = active {
            self.close_pairing(&active).await;
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

    fn as_pairing(&self) -> Option<&dyn QrPairing> {
        Some(self)
    }
}
