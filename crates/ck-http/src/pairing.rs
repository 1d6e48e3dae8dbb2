use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ck_api_types::{
    ChainId, DappMetadata, PairingApproveRequest, PairingCreateRequest, PairingCreateResponse, PairingKeyQuery,
    PairingRejectRequest, PairingStatus, PairingStatusResponse, PendingRequestsResponse, RelayRequestCreated,
    RelayRequestStatus, RelayResponseRequest, RelayRpcError, RelayRpcRequest,
};
use ck_connectors::{
    ConnectorError, PairingApproval, PairingProposal, PairingRelay, parse_pairing_uri,
};
use ck_provider::{
    Eip1193Provider, EventEmitter, Listener, ListenerId, ProviderError, ProviderEvent, ProviderEventKind, RpcRequest,
    current_chain_id, methods, parse_chain_id, request_accounts,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{DEFAULT_SERVICE_URL, SERVICE_URL_VAR, read_json, resolve_endpoint, service_status};

pub const PAIRING_POLL_VAR: &str = "CK_PAIRING_POLL_MS";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn poll_interval_from_env() -> Duration {
    std::env::var(PAIRING_POLL_VAR)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_INTERVAL)
}

fn relay_error(err: anyhow::Error) -> ConnectorError {
    match service_status(&err) {
        Some(404) => ConnectorError::Cancelled,
        Some(401) => ConnectorError::NotAuthorized,
        _ => ConnectorError::Backend(format!("{err:#}")),
    }
}

fn parse_addresses(accounts: &[String]) -> Result<Vec<Address>, ConnectorError> {
    accounts
        .iter()
        .map(|account| {
            account
                .parse::<Address>()
                .map_err(|err| ConnectorError::Backend(format!("invalid account {account}: {err}")))
        })
        .collect()
}

/// App side of the HTTP pairing relay: proposes pairings and polls for the
/// wallet's answer.
///
/// Reads `CK_SERVICE_URL` and `CK_PAIRING_POLL_MS` at construction time.
pub struct HttpPairingRelay {
    endpoint: String,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl Default for HttpPairingRelay {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpPairingRelay {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: resolve_endpoint(endpoint, SERVICE_URL_VAR, DEFAULT_SERVICE_URL),
            http: reqwest::Client::new(),
            poll_interval: poll_interval_from_env(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn status(&self, proposal: &PairingProposal) -> Result<PairingStatusResponse> {
        let response = self
            .http
            .get(format!("{}/pairing/{}", self.endpoint, proposal.topic))
            .query(&PairingKeyQuery {
                key: proposal.key.clone(),
            })
            .send()
            .await
            .context("pairing status transport")?;
        read_json(response, "pairing status").await
    }
}

#[async_trait]
impl PairingRelay for HttpPairingRelay {
    async fn propose(&self, dapp: &DappMetadata, chain_id: ChainId) -> Result<PairingProposal, ConnectorError> {
        let created = async {
            let response = self
                .http
                .post(format!("{}/pairing", self.endpoint))
                .json(&PairingCreateRequest {
                    dapp: dapp.clone(),
                    chain_id,
                })
                .send()
                .await
                .context("pairing create transport")?;
            read_json::<PairingCreateResponse>(response, "pairing create").await
        }
        .await
        .map_err(relay_error)?;

        debug!(topic = %created.topic, "pairing proposed");
        Ok(PairingProposal {
            topic: created.topic,
            key: created.key,
            uri: created.uri,
        })
    }

    async fn wait_for_approval(&self, proposal: &PairingProposal) -> Result<PairingApproval, ConnectorError> {
        loop {
            let status = self.status(proposal).await.map_err(relay_error)?;
            match status.status {
                PairingStatus::Pending => tokio::time::sleep(self.poll_interval).await,
                PairingStatus::Approved => {
                    let accounts = parse_addresses(&status.accounts)?;
                    let chain_id = status
                        .chain_id
                        .ok_or_else(|| ConnectorError::Backend("approved pairing without chain".to_owned()))?;
                    return Ok(PairingApproval { accounts, chain_id });
                }
                PairingStatus::Rejected => {
                    debug!(topic = %proposal.topic, reason = ?status.reason, "wallet rejected pairing");
                    return Err(ConnectorError::UserRejected);
                }
                PairingStatus::Expired => return Err(ConnectorError::Timeout),
                PairingStatus::Cancelled => return Err(ConnectorError::Cancelled),
            }
        }
    }

    async fn cancel(&self, proposal: &PairingProposal) -> Result<(), ConnectorError> {
        let response = self
            .http
            .delete(format!("{}/pairing/{}", self.endpoint, proposal.topic))
            .query(&PairingKeyQuery {
                key: proposal.key.clone(),
            })
            .send()
            .await
            .map_err(|err| ConnectorError::Backend(format!("pairing cancel transport: {err}")))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            debug!(topic = %proposal.topic, "pairing closed on relay");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(ConnectorError::Backend(format!("pairing cancel HTTP {status}: {text}")))
    }

    async fn session_provider(
        &self,
        proposal: &PairingProposal,
        approval: &PairingApproval,
    ) -> Result<Arc<dyn Eip1193Provider>, ConnectorError> {
        Ok(Arc::new(RelayProvider {
            endpoint: self.endpoint.clone(),
            http: self.http.clone(),
            topic: proposal.topic.clone(),
            key: proposal.key.clone(),
            poll_interval: self.poll_interval,
            accounts: approval.accounts.clone(),
            chain_id: Mutex::new(approval.chain_id),
            emitter: EventEmitter::default(),
        }))
    }
}

/// Provider for a paired wallet: every request that needs the wallet is
/// queued on the relay and polled until the wallet answers.
pub struct RelayProvider {
    endpoint: String,
    http: reqwest::Client,
    topic: String,
    key: String,
    poll_interval: Duration,
    accounts: Vec<Address>,
    chain_id: Mutex<ChainId>,
    emitter: EventEmitter,
}

impl RelayProvider {
    fn current_chain(&self) -> ChainId {
        *self.chain_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed(&self) -> ProviderError {
        let err = ProviderError::disconnected();
        self.emitter.emit(&ProviderEvent::Disconnect(err.clone()));
        err
    }

    async fn forward(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        let transport = |err: anyhow::Error| match service_status(&err) {
            Some(404) => self.closed(),
            _ => ProviderError::internal(format!("{err:#}")),
        };

        let created = async {
            let response = self
                .http
                .post(format!("{}/pairing/{}/requests", self.endpoint, self.topic))
                .json(&RelayRpcRequest {
                    key: self.key.clone(),
                    method: request.method.clone(),
                    params: request.params.clone(),
                })
                .send()
                .await
                .context("relay request transport")?;
            read_json::<RelayRequestCreated>(response, "relay request").await
        }
        .await
        .map_err(transport)?;
        debug!(topic = %self.topic, id = created.id, method = %request.method, "request queued for wallet");

        loop {
            let status = async {
                let response = self
                    .http
                    .get(format!("{}/pairing/{}/requests/{}", self.endpoint, self.topic, created.id))
                    .query(&PairingKeyQuery { key: self.key.clone() })
                    .send()
                    .await
                    .context("relay status transport")?;
                read_json::<RelayRequestStatus>(response, "relay status").await
            }
            .await
            .map_err(transport)?;

            if let Some(error) = status.error {
                return Err(ProviderError::new(error.code, error.message));
            }
            if let Some(result) = status.result {
                return Ok(result);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Eip1193Provider for RelayProvider {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        match request.method.as_str() {
            methods::ETH_ACCOUNTS | methods::ETH_REQUEST_ACCOUNTS => Ok(json!(
                self.accounts
                    .iter()
                    .map(|account| account.to_checksum(None))
                    .collect::<Vec<_>>()
            )),
            methods::ETH_CHAIN_ID => Ok(Value::String(self.current_chain().to_hex())),
            methods::WALLET_SWITCH_CHAIN => {
                let target = request
                    .params
                    .get(0)
                    .and_then(|entry| entry.get("chainId"))
                    .ok_or_else(|| ProviderError::invalid_params("missing chainId"))
                    .and_then(parse_chain_id)?;
                let result = self.forward(request).await?;
                let changed = {
                    let mut current = self.chain_id.lock().unwrap_or_else(PoisonError::into_inner);
                    let changed = *current != target;
                    *current = target;
                    changed
                };
                if changed {
                    self.emitter.emit(&ProviderEvent::ChainChanged(target));
                }
                Ok(result)
            }
            _ => self.forward(request).await,
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

/// Wallet side of the HTTP pairing relay. The relay endpoint is taken from
/// the scanned URI.
#[derive(Default)]
pub struct HttpPairingWallet {
    http: reqwest::Client,
}

impl HttpPairingWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks `wallet` for its accounts and approves the pairing with them.
    pub async fn approve(&self, raw_uri: &str, wallet: &dyn Eip1193Provider) -> Result<PairingApproval, ConnectorError> {
        let uri = parse_pairing_uri(raw_uri)?;
        let accounts = request_accounts(wallet, false).await?;
        if accounts.is_empty() {
            return Err(ConnectorError::NotAuthorized);
        }
        let chain_id = current_chain_id(wallet).await?;

        async {
            let response = self
                .http
                .post(format!("{}/pairing/{}/approve", uri.relay, uri.topic))
                .json(&PairingApproveRequest {
                    key: uri.key.clone(),
                    accounts: accounts.iter().map(|account| account.to_checksum(None)).collect(),
                    chain_id,
                })
                .send()
                .await
                .context("pairing approve transport")?;
            read_json::<PairingStatusResponse>(response, "pairing approve").await
        }
        .await
        .map_err(relay_error)?;

        info!(topic = %uri.topic, "pairing approved");
        Ok(PairingApproval { accounts, chain_id })
    }

    pub async fn reject(&self, raw_uri: &str, reason: &str) -> Result<(), ConnectorError> {
        let uri = parse_pairing_uri(raw_uri)?;
        async {
            let response = self
                .http
                .post(format!("{}/pairing/{}/reject", uri.relay, uri.topic))
                .json(&PairingRejectRequest {
                    key: uri.key.clone(),
                    reason: Some(reason.to_owned()),
                })
                .send()
                .await
                .context("pairing reject transport")?;
            read_json::<PairingStatusResponse>(response, "pairing reject").await
        }
        .await
        .map_err(relay_error)?;
        Ok(())
    }

    /// Answers every request the app has queued, using `wallet`. Returns how
    /// many were answered.
    pub async fn serve_pending(&self, raw_uri: &str, wallet: &dyn Eip1193Provider) -> Result<usize> {
        let uri = parse_pairing_uri(raw_uri)?;
        let response = self
            .http
            .get(format!("{}/pairing/{}/pending", uri.relay, uri.topic))
            .query(&PairingKeyQuery { key: uri.key.clone() })
            .send()
            .await
            .context("pairing pending transport")?;
        let pending: PendingRequestsResponse = read_json(response, "pairing pending").await?;

        let mut answered = 0;
        for request in pending.requests {
            let outcome = wallet
                .request(RpcRequest::new(request.method.clone(), request.params.clone()))
                .await;
            let (result, error) = match outcome {
                Ok(result) => (Some(result), None),
                Err(err) => (
                    None,
                    Some(RelayRpcError {
                        code: err.code,
                        message: err.message,
                    }),
                ),
            };

            let response = self
                .http
                .post(format!("{}/pairing/{}/requests/{}/response", uri.relay, uri.topic, request.id))
                .json(&RelayResponseRequest {
                    key: uri.key.clone(),
                    result,
                    error,
                })
                .send()
                .await
                .context("pairing response transport")?;
            match read_json::<RelayRequestStatus>(response, "pairing response").await {
                Ok(_) => answered += 1,
                Err(err) => warn!(topic = %uri.topic, id = request.id, error = %err, "failed to answer relay request"),
            }
        }
        Ok(answered)
    }
}
