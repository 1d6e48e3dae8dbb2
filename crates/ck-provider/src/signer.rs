use alloy_primitives::{Address, hex};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::{Eip1193Provider, ProviderError, RpcRequest, methods};

#[async_trait]
pub trait MessageSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Returns the `0x`-prefixed 65-byte signature.
    async fn sign_message(&self, message: &[u8]) -> Result<String, ProviderError>;
}

/// Signs through `personal_sign` on whatever provider backs the connection.
pub struct ProviderSigner {
    provider: Arc<dyn Eip1193Provider>,
    address: Address,
}

impl ProviderSigner {
    pub fn new(provider: Arc<dyn Eip1193Provider>, address: Address) -> Self {
        Self { provider, address }
    }
}

#[async_trait]
impl MessageSigner for ProviderSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String, ProviderError> {
        let params = json!([hex::encode_prefixed(message), self.address.to_checksum(None)]);
        let value = self
            .provider
            .request(RpcRequest::new(methods::PERSONAL_SIGN, params))
            .await?;

        match value {
            Value::String(signature) => Ok(signature),
            other => Err(ProviderError::internal(format!("unexpected personal_sign result: {other}"))),
        }
    }
}
