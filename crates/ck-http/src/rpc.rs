use async_trait::async_trait;
use ck_provider::{Eip1193Provider, EventEmitter, Listener, ListenerId, ProviderError, ProviderEventKind, RpcRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::{DEFAULT_RPC_URL, RPC_URL_VAR, resolve_endpoint};

/// Read-only JSON-RPC 2.0 node reached over HTTP.
///
/// Reads `CK_RPC_URL` at construction time (default:
/// `http://localhost:8545`). A node has no wallet events, so listeners are
/// accepted but never called.
pub struct HttpRpcProvider {
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    emitter: EventEmitter,
}

impl Default for HttpRpcProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpRpcProvider {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: resolve_endpoint(endpoint, RPC_URL_VAR, DEFAULT_RPC_URL),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            emitter: EventEmitter::default(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn into_result(response: JsonRpcResponse) -> Result<Value, ProviderError> {
    match (response.result, response.error) {
        (_, Some(error)) => Err(ProviderError::new(error.code, error.message)),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    }
}

#[async_trait]
impl Eip1193Provider for HttpRpcProvider {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = if request.params.is_null() { json!([]) } else { request.params };
        debug!(endpoint = %self.endpoint, method = %request.method, id, "rpc request");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&JsonRpcRequest {
                jsonrpc: "2.0",
                id,
                method: &request.method,
                params,
            })
            .send()
            .await
            .map_err(|err| ProviderError::new(ProviderError::DISCONNECTED, format!("rpc transport: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::internal(format!("rpc HTTP {status}: {text}")));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::internal(format!("rpc parse: {err}")))?;
        into_result(body)
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
