//! reqwest clients for the connect service and JSON-RPC nodes.

use anyhow::{Context, Result};
use ck_api_types::ErrorResponse;
use serde::de::DeserializeOwned;

mod auth;
mod embedded;
mod pairing;
mod rpc;

pub use auth::HttpAuthBackend;
pub use embedded::HttpEmbeddedBackend;
pub use pairing::{HttpPairingRelay, HttpPairingWallet, RelayProvider};
pub use rpc::HttpRpcProvider;

pub const SERVICE_URL_VAR: &str = "CK_SERVICE_URL";
pub const RPC_URL_VAR: &str = "CK_RPC_URL";
pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8080";
pub const DEFAULT_RPC_URL: &str = "http://localhost:8545";

/// Explicit endpoint, else the environment variable, else `default`.
pub(crate) fn resolve_endpoint(endpoint: Option<String>, var: &str, default: &str) -> String {
    let endpoint = endpoint
        .or_else(|| std::env::var(var).ok())
        .unwrap_or_else(|| default.to_string());
    endpoint.trim_end_matches('/').to_string()
}

/// Non-2xx answer from the service.
#[derive(Debug, thiserror::Error)]
#[error("{operation} HTTP {status}: {message}")]
pub struct ServiceError {
    pub operation: &'static str,
    pub status: u16,
    pub message: String,
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response, operation: &'static str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        return Err(ServiceError {
            operation,
            status: status.as_u16(),
            message,
        }
        .into());
    }
    response
        .json()
        .await
        .with_context(|| format!("{operation} parse"))
}

pub(crate) fn service_status(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<ServiceError>().map(|err| err.status)
}
