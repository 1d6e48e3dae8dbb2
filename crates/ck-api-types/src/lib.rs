use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const MAINNET: ChainId = ChainId(1);
    pub const SEPOLIA: ChainId = ChainId(11_155_111);
    pub const POLYGON: ChainId = ChainId(137);
    pub const BASE: ChainId = ChainId(8453);

    /// Quantity encoding used by `eth_chainId` and the `wallet_*` methods.
    pub fn to_hex(self) -> String {
        format!("0x{:x}", self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
        u64::from_str_radix(digits, 16).ok().map(ChainId)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chain {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub native_currency: NativeCurrency,
    #[serde(default)]
    pub block_explorer_urls: Vec<String>,
    #[serde(default)]
    pub testnet: bool,
}

/// Parameter object of `wallet_addEthereumChain` (EIP-3085).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddEthereumChainParameter {
    pub chain_id: String,
    pub chain_name: String,
    pub rpc_urls: Vec<String>,
    pub native_currency: NativeCurrency,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_explorer_urls: Vec<String>,
}

impl Chain {
    pub fn add_chain_parameter(&self) -> AddEthereumChainParameter {
        AddEthereumChainParameter {
            chain_id: self.chain_id.to_hex(),
            chain_name: self.name.clone(),
            rpc_urls: self.rpc_urls.clone(),
            native_currency: self.native_currency.clone(),
            block_explorer_urls: self.block_explorer_urls.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WalletId(pub String);

impl WalletId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletUrls {
    #[serde(default)]
    pub android: Option<String>,
    #[serde(default)]
    pub ios: Option<String>,
    #[serde(default)]
    pub chrome: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletMeta {
    pub name: String,
    pub icon_url: String,
    #[serde(default)]
    pub urls: Option<WalletUrls>,
    /// Universal-link prefix used to open a dapp URL inside the wallet's mobile app.
    #[serde(default)]
    pub deep_link: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DappMetadata {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icons: Vec<String>,
}

/// Body of every non-2xx response from the connect service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ── Auth ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallengeRequest {
    pub address: String,
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallengeResponse {
    pub message: String,
    pub nonce: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLoginRequest {
    pub message: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLoginResponse {
    pub token: String,
    pub address: String,
    pub expires_at_epoch_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUserResponse {
    pub address: String,
}

// ── Embedded (custodial) wallet ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedOtpRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedOtpResponse {
    pub sent: bool,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedVerifyRequest {
    pub email: String,
    pub otp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedVerifyResponse {
    pub address: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedSignRequest {
    pub message_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedSignResponse {
    pub signature: String,
}

// ── Pairing relay ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCreateRequest {
    pub dapp: DappMetadata,
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCreateResponse {
    pub topic: String,
    pub key: String,
    /// `ckpair:` URI to render as a QR code.
    pub uri: String,
    pub expires_in: u64,
}

/// Pairing key for requests that carry no body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingKeyQuery {
    pub key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingStatusResponse {
    pub topic: String,
    pub status: PairingStatus,
    #[serde(default)]
    pub dapp: Option<DappMetadata>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub chain_id: Option<ChainId>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingApproveRequest {
    pub key: String,
    pub accounts: Vec<String>,
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRejectRequest {
    pub key: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRpcRequest {
    pub key: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequestCreated {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequestStatus {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RelayRpcError>,
}

impl RelayRequestStatus {
    pub fn is_settled(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponseRequest {
    pub key: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RelayRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequestsResponse {
    pub requests: Vec<RelayRequestStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_hex_quantity() {
        assert_eq!(ChainId(1).to_hex(), "0x1");
        assert_eq!(ChainId::SEPOLIA.to_hex(), "0xaa36a7");
        assert_eq!(ChainId::from_hex("0x89"), Some(ChainId::POLYGON));
        assert_eq!(ChainId::from_hex("137"), None);
    }

    #[test]
    fn add_chain_parameter_uses_camel_case() {
        let chain = Chain {
            chain_id: ChainId::BASE,
            name: "Base".to_owned(),
            rpc_urls: vec!["https://mainnet.base.org".to_owned()],
            native_currency: NativeCurrency {
                name: "Ether".to_owned(),
                symbol: "ETH".to_owned(),
                decimals: 18,
            },
            block_explorer_urls: Vec::new(),
            testnet: false,
        };

        let json = serde_json::to_value(chain.add_chain_parameter()).unwrap();
        assert_eq!(json["chainId"], "0x2105");
        assert_eq!(json["chainName"], "Base");
        assert!(json.get("blockExplorerUrls").is_none());
    }
}
