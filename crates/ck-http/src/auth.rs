use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ck_api_types::{
    AuthChallengeRequest, AuthChallengeResponse, AuthLoginRequest, AuthLoginResponse, AuthUserResponse, ChainId,
};
use ck_auth_adapter::AuthBackend;

use crate::{DEFAULT_SERVICE_URL, SERVICE_URL_VAR, read_json, resolve_endpoint};

/// Sign-in endpoints of the connect service.
///
/// Reads `CK_SERVICE_URL` at construction time (default:
/// `http://localhost:8080`).
pub struct HttpAuthBackend {
    endpoint: String,
    http: reqwest::Client,
}

impl Default for HttpAuthBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpAuthBackend {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: resolve_endpoint(endpoint, SERVICE_URL_VAR, DEFAULT_SERVICE_URL),
            http: reqwest::Client::new(),
        }
    }

    /// Account behind a session token issued by `login`.
    pub async fn user(&self, token: &str) -> Result<AuthUserResponse> {
        let response = self
            .http
            .get(format!("{}/auth/user", self.endpoint))
            .bearer_auth(token)
            .send()
            .await
            .context("auth user transport")?;
        read_json(response, "auth user").await
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn challenge(&self, address: Address, chain_id: ChainId) -> Result<AuthChallengeResponse> {
        let response = self
            .http
            .post(format!("{}/auth/challenge", self.endpoint))
            .json(&AuthChallengeRequest {
                address: address.to_checksum(None),
                chain_id,
            })
            .send()
            .await
            .context("auth challenge transport")?;
        read_json(response, "auth challenge").await
    }

    async fn login(&self, request: AuthLoginRequest) -> Result<AuthLoginResponse> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.endpoint))
            .json(&request)
            .send()
            .await
            .context("auth login transport")?;
        read_json(response, "auth login").await
    }
}
