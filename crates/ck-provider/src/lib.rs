//! EIP-1193 provider boundary.
//!
//! Every wallet backend (browser extension, paired phone, custodial service,
//! in-process key) is reached through [`Eip1193Provider`]: a JSON-RPC
//! `request` call plus `accountsChanged` / `chainChanged` / `disconnect`
//! events.

use alloy_primitives::Address;
use async_trait::async_trait;
use ck_api_types::ChainId;
use serde_json::Value;
use std::sync::Arc;

mod chains;
mod emitter;
mod local;
mod signer;

pub use chains::{ChainRegistry, builtin_chains};
pub use emitter::EventEmitter;
pub use local::{Approval, LocalProvider, LocalProviderBuilder};
pub use signer::{MessageSigner, ProviderSigner};

pub mod methods {
    pub const ETH_REQUEST_ACCOUNTS: &str = "eth_requestAccounts";
    pub const ETH_ACCOUNTS: &str = "eth_accounts";
    pub const ETH_CHAIN_ID: &str = "eth_chainId";
    pub const NET_VERSION: &str = "net_version";
    pub const PERSONAL_SIGN: &str = "personal_sign";
    pub const WALLET_SWITCH_CHAIN: &str = "wallet_switchEthereumChain";
    pub const WALLET_ADD_CHAIN: &str = "wallet_addEthereumChain";
    pub const WALLET_WATCH_ASSET: &str = "wallet_watchAsset";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
}

impl ProviderError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(Self::USER_REJECTED, "user rejected the request")
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "account not authorized")
    }

    pub fn unsupported_method(method: &str) -> Self {
        Self::new(Self::UNSUPPORTED_METHOD, format!("unsupported method: {method}"))
    }

    pub fn unrecognized_chain(chain_id: ChainId) -> Self {
        Self::new(Self::UNRECOGNIZED_CHAIN, format!("unrecognized chain id {chain_id}"))
    }

    pub fn disconnected() -> Self {
        Self::new(Self::DISCONNECTED, "provider disconnected")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }

    pub fn is_user_rejected(&self) -> bool {
        self.code == Self::USER_REJECTED
    }

    pub fn is_unrecognized_chain(&self) -> bool {
        self.code == Self::UNRECOGNIZED_CHAIN
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn method_only(method: impl Into<String>) -> Self {
        Self::new(method, Value::Array(Vec::new()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    AccountsChanged,
    ChainChanged,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
    Disconnect(ProviderError),
}

impl ProviderEvent {
    pub fn kind(&self) -> ProviderEventKind {
        match self {
            ProviderEvent::AccountsChanged(_) => ProviderEventKind::AccountsChanged,
            ProviderEvent::ChainChanged(_) => ProviderEventKind::ChainChanged,
            ProviderEvent::Disconnect(_) => ProviderEventKind::Disconnect,
        }
    }
}

pub type Listener = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[async_trait]
pub trait Eip1193Provider: Send + Sync {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError>;
    fn on(&self, kind: ProviderEventKind, listener: Listener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
    fn listener_count(&self) -> usize;
}

pub fn parse_accounts(value: &Value) -> Result<Vec<Address>, ProviderError> {
    let entries = value
        .as_array()
        .ok_or_else(|| ProviderError::internal("accounts response is not an array"))?;

    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .and_then(|raw| raw.parse::<Address>().ok())
                .ok_or_else(|| ProviderError::internal(format!("invalid account entry: {entry}")))
        })
        .collect()
}

/// Accepts both the hex quantity wallets return and a bare number.
pub fn parse_chain_id(value: &Value) -> Result<ChainId, ProviderError> {
    match value {
        Value::String(raw) => ChainId::from_hex(raw)
            .or_else(|| raw.parse::<u64>().ok().map(ChainId))
            .ok_or_else(|| ProviderError::internal(format!("invalid chain id: {raw}"))),
        Value::Number(number) => number
            .as_u64()
            .map(ChainId)
            .ok_or_else(|| ProviderError::internal(format!("invalid chain id: {number}"))),
        other => Err(ProviderError::internal(format!("invalid chain id: {other}"))),
    }
}

pub async fn request_accounts(provider: &dyn Eip1193Provider, silent: bool) -> Result<Vec<Address>, ProviderError> {
    let method = if silent {
        methods::ETH_ACCOUNTS
    } else {
        methods::ETH_REQUEST_ACCOUNTS
    };
    let value = provider.request(RpcRequest::method_only(method)).await?;
    parse_accounts(&value)
}

pub async fn current_chain_id(provider: &dyn Eip1193Provider) -> Result<ChainId, ProviderError> {
    let value = provider.request(RpcRequest::method_only(methods::ETH_CHAIN_ID)).await?;
    parse_chain_id(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_accounts_and_chain_ids() {
        let accounts = parse_accounts(&json!(["0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"])).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(
            accounts[0].to_checksum(None),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );

        assert_eq!(parse_chain_id(&json!("0x89")).unwrap(), ChainId::POLYGON);
        assert_eq!(parse_chain_id(&json!(8453)).unwrap(), ChainId::BASE);
        assert!(parse_accounts(&json!({"a": 1})).is_err());
        assert!(parse_chain_id(&json!(null)).is_err());
    }
}
