use alloy_primitives::{Address, hex};
use anyhow::Context;
use async_trait::async_trait;
use ck_api_types::{
    EmbeddedOtpRequest, EmbeddedOtpResponse, EmbeddedSignRequest, EmbeddedSignResponse, EmbeddedVerifyRequest,
    EmbeddedVerifyResponse,
};
use ck_connectors::{ConnectorError, EmbeddedBackend, EmbeddedSession};
use tracing::debug;

use crate::{DEFAULT_SERVICE_URL, SERVICE_URL_VAR, read_json, resolve_endpoint, service_status};

/// Custodial wallet endpoints of the connect service.
pub struct HttpEmbeddedBackend {
    endpoint: String,
    http: reqwest::Client,
}

impl Default for HttpEmbeddedBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpEmbeddedBackend {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: resolve_endpoint(endpoint, SERVICE_URL_VAR, DEFAULT_SERVICE_URL),
            http: reqwest::Client::new(),
        }
    }
}

fn backend_error(err: anyhow::Error, unauthorized: ConnectorError) -> ConnectorError {
    match service_status(&err) {
        Some(401) => unauthorized,
        _ => ConnectorError::Backend(format!("{err:#}")),
    }
}

#[async_trait]
impl EmbeddedBackend for HttpEmbeddedBackend {
    async fn send_otp(&self, email: &str) -> Result<(), ConnectorError> {
        let sent = async {
            let response = self
                .http
                .post(format!("{}/embedded/otp", self.endpoint))
                .json(&EmbeddedOtpRequest {
                    email: email.to_owned(),
                })
                .send()
                .await
                .context("embedded otp transport")?;
            read_json::<EmbeddedOtpResponse>(response, "embedded otp").await
        }
        .await
        .map_err(|err| backend_error(err, ConnectorError::NotAuthorized))?;
        debug!(expires_in = sent.expires_in, "one-time code sent");
        Ok(())
    }

    async fn verify_otp(&self, email: &str, otp: &str) -> Result<EmbeddedSession, ConnectorError> {
        let verified = async {
            let response = self
                .http
                .post(format!("{}/embedded/verify", self.endpoint))
                .json(&EmbeddedVerifyRequest {
                    email: email.to_owned(),
                    otp: otp.to_owned(),
                })
                .send()
                .await
                .context("embedded verify transport")?;
            read_json::<EmbeddedVerifyResponse>(response, "embedded verify").await
        }
        .await
        .map_err(|err| backend_error(err, ConnectorError::InvalidOtp))?;

        let address = verified
            .address
            .parse::<Address>()
            .map_err(|err| ConnectorError::Backend(format!("invalid address from backend: {err}")))?;
        Ok(EmbeddedSession {
            email: email.to_owned(),
            address,
            token: verified.token,
        })
    }

    async fn sign_message(&self, session: &EmbeddedSession, message: &[u8]) -> Result<String, ConnectorError> {
        let signed = async {
            let response = self
                .http
                .post(format!("{}/embedded/sign", self.endpoint))
                .bearer_auth(&session.token)
                .json(&EmbeddedSignRequest {
                    message_hex: hex::encode_prefixed(message),
                })
                .send()
                .await
                .context("embedded sign transport")?;
            read_json::<EmbeddedSignResponse>(response, "embedded sign").await
        }
        .await
        .map_err(|err| backend_error(err, ConnectorError::NotAuthorized))?;
        Ok(signed.signature)
    }
}
