use alloy_primitives::{Address, hex};
use async_trait::async_trait;
use ck_api_types::ChainId;
use ck_crypto::LocalSigner;
use ck_provider::{
    ChainRegistry, Eip1193Provider, EventEmitter, Listener, ListenerId, MessageSigner, ProviderError, ProviderEvent,
    ProviderEventKind, RpcRequest, methods, parse_chain_id,
};
use rand::Rng;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    Capabilities, ConnectParams, Connector, ConnectorError, ConnectorEvent, OtpLogin, ProviderSession,
    switch_chain_with_fallback,
};

const DEFAULT_OTP_TTL: Duration = Duration::from_secs(600);

/// Authenticated custodial wallet: the backend holds the key, the token
/// authorizes signing with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedSession {
    pub email: String,
    pub address: Address,
    pub token: String,
}

#[async_trait]
pub trait EmbeddedBackend: Send + Sync {
    async fn send_otp(&self, email: &str) -> Result<(), ConnectorError>;
    /// Fails with `InvalidOtp` for a wrong or expired code.
    async fn verify_otp(&self, email: &str, otp: &str) -> Result<EmbeddedSession, ConnectorError>;
    /// EIP-191 signature over `message`, 0x-prefixed hex.
    async fn sign_message(&self, session: &EmbeddedSession, message: &[u8]) -> Result<String, ConnectorError>;
}

pub(crate) fn generate_otp() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

#[derive(Default)]
struct BackendState {
    codes: HashMap<String, (String, Instant)>,
    keys: HashMap<String, Arc<LocalSigner>>,
    tokens: HashMap<String, String>,
}

/// Custodial backend kept in process memory. Codes are not delivered
/// anywhere; [`last_otp`](Self::last_otp) exposes them instead.
pub struct InMemoryEmbeddedBackend {
    otp_ttl: Duration,
    state: Mutex<BackendState>,
}

impl Default for InMemoryEmbeddedBackend {
    fn default() -> Self {
        Self::new(DEFAULT_OTP_TTL)
    }
}

impl InMemoryEmbeddedBackend {
    pub fn new(otp_ttl: Duration) -> Self {
        Self {
            otp_ttl,
            state: Mutex::new(BackendState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_otp(&self, email: &str) -> Option<String> {
        self.state()
            .codes
            .get(&normalize_email(email))
            .map(|(code, _)| code.clone())
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[async_trait]
impl EmbeddedBackend for InMemoryEmbeddedBackend {
    async fn send_otp(&self, email: &str) -> Result<(), ConnectorError> {
        let email = normalize_email(email);
        if !email.contains('@') {
            return Err(ConnectorError::Backend(format!("invalid email address: {email}")));
        }
        let code = generate_otp();
        self.state()
            .codes
            .insert(email.clone(), (code, Instant::now() + self.otp_ttl));
        debug!(%email, "one-time code issued");
        Ok(())
    }

    async fn verify_otp(&self, email: &str, otp: &str) -> Result<EmbeddedSession, ConnectorError> {
        let email = normalize_email(email);
        let mut state = self.state();
        match state.codes.get(&email) {
            Some((code, expires_at)) if code == otp.trim() && Instant::now() < *expires_at => {}
            _ => return Err(ConnectorError::InvalidOtp),
        }
        state.codes.remove(&email);

        let signer = state
            .keys
            .entry(email.clone())
            .or_insert_with(|| Arc::new(LocalSigner::new_random()))
            .clone();
        let token = uuid::Uuid::new_v4().to_string();
        state.tokens.insert(token.clone(), email.clone());
        Ok(EmbeddedSession {
            email,
            address: signer.address(),
            token,
        })
    }

    async fn sign_message(&self, session: &EmbeddedSession, message: &[u8]) -> Result<String, ConnectorError> {
        let signer = {
            let state = self.state();
            let email = state.tokens.get(&session.token).ok_or(ConnectorError::NotAuthorized)?;
            state.keys.get(email).cloned().ok_or(ConnectorError::NotAuthorized)?
        };
        let signature = signer.sign_message(message).map_err(ConnectorError::backend)?;
        Ok(hex::encode_prefixed(signature))
    }
}

/// Provider for an embedded wallet. Accounts and chain are answered
/// locally; signing goes to the custodial backend.
pub struct EmbeddedProvider {
    backend: Arc<dyn EmbeddedBackend>,
    session: EmbeddedSession,
    chains: ChainRegistry,
    chain_id: Mutex<ChainId>,
    upstream: Option<Arc<dyn Eip1193Provider>>,
    emitter: EventEmitter,
}

impl EmbeddedProvider {
    pub fn new(
        backend: Arc<dyn EmbeddedBackend>,
        session: EmbeddedSession,
        chains: ChainRegistry,
        chain_id: ChainId,
        upstream: Option<Arc<dyn Eip1193Provider>>,
    ) -> Self {
        Self {
            backend,
            session,
            chains,
            chain_id: Mutex::new(chain_id),
            upstream,
            emitter: EventEmitter::default(),
        }
    }

    fn current_chain(&self) -> ChainId {
        *self.chain_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn switch_chain(&self, params: &Value) -> Result<Value, ProviderError> {
        let raw = params
            .get(0)
            .and_then(|entry| entry.get("chainId"))
            .ok_or_else(|| ProviderError::invalid_params("missing chainId"))?;
        let target = parse_chain_id(raw)?;
        if !self.chains.contains(target) {
            return Err(ProviderError::unrecognized_chain(target));
        }

        let changed = {
            let mut current = self.chain_id.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *current != target;
            *current = target;
            changed
        };
        if changed {
            self.emitter.emit(&ProviderEvent::ChainChanged(target));
        }
        Ok(Value::Null)
    }

    async fn personal_sign(&self, params: &Value) -> Result<Value, ProviderError> {
        let data = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_params("missing message"))?;
        let address = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_params("missing address"))?;
        if !address.eq_ignore_ascii_case(&self.session.address.to_checksum(None)) {
            return Err(ProviderError::unauthorized());
        }

        let message = hex::decode(data).map_err(|err| ProviderError::invalid_params(err.to_string()))?;
        let signature = self
            .backend
            .sign_message(&self.session, &message)
            .await
            .map_err(|err| match err {
                ConnectorError::UserRejected => ProviderError::user_rejected(),
                ConnectorError::NotAuthorized => ProviderError::unauthorized(),
                other => ProviderError::internal(other.to_string()),
            })?;
        Ok(Value::String(signature))
    }
}

#[async_trait]
impl Eip1193Provider for EmbeddedProvider {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        match request.method.as_str() {
            methods::ETH_ACCOUNTS | methods::ETH_REQUEST_ACCOUNTS => {
                Ok(json!([self.session.address.to_checksum(None)]))
            }
            methods::ETH_CHAIN_ID => Ok(Value::String(self.current_chain().to_hex())),
            methods::NET_VERSION => Ok(Value::String(self.current_chain().to_string())),
            methods::WALLET_SWITCH_CHAIN => self.switch_chain(&request.params),
            methods::WALLET_ADD_CHAIN => Err(ProviderError::unsupported_method(methods::WALLET_ADD_CHAIN)),
            methods::PERSONAL_SIGN => self.personal_sign(&request.params).await,
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

/// Email wallet: a one-time code sent to the user unlocks a key held by
/// the backend.
pub struct EmbeddedConnector {
    id: String,
    backend: Arc<dyn EmbeddedBackend>,
    chains: ChainRegistry,
    default_chain: ChainId,
    upstream: Option<Arc<dyn Eip1193Provider>>,
    session: ProviderSession,
}

impl EmbeddedConnector {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn EmbeddedBackend>,
        chains: ChainRegistry,
        default_chain: ChainId,
        upstream: Option<Arc<dyn Eip1193Provider>>,
    ) -> Self {
        let id = id.into();
        Self {
            session: ProviderSession::new(id.clone()),
            id,
            backend,
            chains,
            default_chain,
            upstream,
        }
    }
}

#[async_trait]
impl OtpLogin for EmbeddedConnector {
    async fn send_otp(&self, email: &str) -> Result<(), ConnectorError> {
        self.backend.send_otp(email).await?;
        info!(connector = %self.id, "one-time code requested");
        Ok(())
    }
}

#[async_trait]
impl Connector for EmbeddedConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            otp_login: true,
            ..Capabilities::default()
        }
    }

    async fn connect(&self, params: ConnectParams) -> Result<Address, ConnectorError> {
        if params.silent {
            return Err(ConnectorError::NotAuthorized);
        }
        let email = params.email.as_deref().ok_or(ConnectorError::MissingParameter("email"))?;
        let otp = params.otp.as_deref().ok_or(ConnectorError::MissingParameter("otp"))?;
        let chain_id = params.chain_id.unwrap_or(self.default_chain);
        if !self.chains.contains(chain_id) {
            return Err(ConnectorError::ChainNotConfigured {
                chain_id,
                reason: "not in the app chain list".to_owned(),
            });
        }

        let generation = self.session.begin();
        let session = self.backend.verify_otp(email, otp).await?;
        let address = session.address;
        let provider = Arc::new(EmbeddedProvider::new(
            self.backend.clone(),
            session,
            self.chains.clone(),
            chain_id,
            self.upstream.clone(),
        ));
        self.session.establish(generation, provider, address, chain_id)?;
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
        switch_chain_with_fallback(provider.as_ref(), chain_id, &self.chains, false).await?;
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

    fn as_otp(&self) -> Option<&dyn OtpLogin> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use ck_crypto::recover_address;

    fn connector(backend: Arc<InMemoryEmbeddedBackend>) -> EmbeddedConnector {
        EmbeddedConnector::new("embedded", backend, ChainRegistry::with_defaults(), ChainId::MAINNET, None)
    }

    fn params(email: &str, otp: &str) -> ConnectParams {
        ConnectParams {
            email: Some(email.to_owned()),
            otp: Some(otp.to_owned()),
            ..ConnectParams::default()
        }
    }

    #[tokio::test]
    async fn otp_login_connects_and_signs_with_custodial_key() -> Result<()> {
        let backend = Arc::new(InMemoryEmbeddedBackend::default());
        let connector = connector(backend.clone());

        connector.send_otp("Ada@Example.com").await?;
        let code = backend.last_otp("ada@example.com").context("code issued")?;
        let address = connector.connect(params("ada@example.com", &code)).await?;
        assert_eq!(connector.address().await?, address);
        assert_eq!(connector.listener_count(), 3);

        let signature = connector.signer().await?.sign_message(b"gm").await?;
        assert_eq!(recover_address(b"gm", &hex::decode(signature)?)?, address);
        Ok(())
    }

    #[tokio::test]
    async fn same_email_keeps_same_wallet() -> Result<()> {
        let backend = Arc::new(InMemoryEmbeddedBackend::default());
        let connector = connector(backend.clone());

        connector.send_otp("ada@example.com").await?;
        let first = connector
            .connect(params("ada@example.com", &backend.last_otp("ada@example.com").context("code")?))
            .await?;
        connector.disconnect().await?;

        connector.send_otp("ada@example.com").await?;
        let second = connector
            .connect(params("ada@example.com", &backend.last_otp("ada@example.com").context("code")?))
            .await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_code_is_refused_and_code_is_single_use() -> Result<()> {
        let backend = Arc::new(InMemoryEmbeddedBackend::default());
        let connector = connector(backend.clone());
        connector.send_otp("ada@example.com").await?;
        let code = backend.last_otp("ada@example.com").context("code")?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        assert_eq!(
            connector.connect(params("ada@example.com", wrong)).await.unwrap_err(),
            ConnectorError::InvalidOtp
        );
        connector.connect(params("ada@example.com", &code)).await?;
        connector.disconnect().await?;
        assert_eq!(
            connector.connect(params("ada@example.com", &code)).await.unwrap_err(),
            ConnectorError::InvalidOtp
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_code_is_refused() -> Result<()> {
        let backend = Arc::new(InMemoryEmbeddedBackend::new(Duration::from_secs(60)));
        let connector = connector(backend.clone());
        connector.send_otp("ada@example.com").await?;
        let code = backend.last_otp("ada@example.com").context("code")?;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            connector.connect(params("ada@example.com", &code)).await.unwrap_err(),
            ConnectorError::InvalidOtp
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_fields_are_reported() {
        let connector = connector(Arc::new(InMemoryEmbeddedBackend::default()));
        assert_eq!(
            connector.connect(ConnectParams::default()).await.unwrap_err(),
            ConnectorError::MissingParameter("email")
        );
        let only_email = ConnectParams {
            email: Some("ada@example.com".to_owned()),
            ..ConnectParams::default()
        };
        assert_eq!(
            connector.connect(only_email).await.unwrap_err(),
            ConnectorError::MissingParameter("otp")
        );
    }

    #[tokio::test]
    async fn configured_chain_switches_and_unknown_chain_is_not_added() -> Result<()> {
        let backend = Arc::new(InMemoryEmbeddedBackend::default());
        let connector = connector(backend.clone());
        connector.send_otp("ada@example.com").await?;
        let code = backend.last_otp("ada@example.com").context("code")?;
        connector.connect(params("ada@example.com", &code)).await?;

        connector.switch_chain(ChainId::BASE).await?;
        assert_eq!(connector.chain_id().await?, ChainId::BASE);

        let err = connector.switch_chain(ChainId(777)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ChainNotConfigured { .. }));
        assert_eq!(connector.chain_id().await?, ChainId::BASE);
        Ok(())
    }
}
