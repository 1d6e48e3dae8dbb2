use alloy_primitives::Address;
use anyhow::{Context, Result};
use axum::{Json, extract::State, http::HeaderMap};
use ck_api_types::{AuthChallengeRequest, AuthChallengeResponse, AuthLoginRequest, AuthLoginResponse, AuthUserResponse, ChainId};
use ck_auth_adapter::{challenge_response, epoch_ms, issue_challenge, verify_login_signature};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::{AppState, ApiResult, bad_request, bearer_token, internal_error, unauthorized};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Issued by `/auth/login` to a wallet that signed in.
    User,
    /// Issued by `/embedded/verify`; lets the holder sign with a custodial key.
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub sub: String,
    pub kind: TokenKind,
    pub iat: u64,
    pub exp: u64,
}

/// HS256 session tokens.
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionTokens {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Returns the token and its expiry in epoch milliseconds.
    pub fn issue(&self, subject: &str, kind: TokenKind) -> Result<(String, u128)> {
        let now_ms = epoch_ms()?;
        let iat = u64::try_from(now_ms / 1000).context("clock out of range")?;
        let exp = iat + self.ttl.as_secs();
        let claims = SessionClaims {
            sub: subject.to_owned(),
            kind,
            iat,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).context("failed to sign session token")?;
        Ok((token, u128::from(exp) * 1000))
    }

    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<SessionClaims> {
        let data = decode::<SessionClaims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .context("invalid session token")?;
        if data.claims.kind != kind {
            anyhow::bail!("session token has the wrong kind");
        }
        Ok(data.claims)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChallengeRecord {
    address: Address,
    chain_id: ChainId,
    expires_at_epoch_ms: u128,
    used: bool,
}

pub(crate) async fn auth_challenge(
    State(state): State<AppState>,
    Json(request): Json<AuthChallengeRequest>,
) -> ApiResult<AuthChallengeResponse> {
    let address = request
        .address
        .trim()
        .parse::<Address>()
        .map_err(|err| bad_request(&format!("invalid address: {err}")))?;

    let challenge = issue_challenge(
        &state.config.auth_domain,
        address,
        request.chain_id,
        state.config.challenge_ttl.as_secs(),
    )
    .map_err(internal_error)?;
    let now = epoch_ms().map_err(internal_error)?;

    {
        let mut store = state.challenges.write().await;
        store.retain(|_, record| !record.used && record.expires_at_epoch_ms > now);
        store.insert(
            challenge.payload.nonce.clone(),
            ChallengeRecord {
                address,
                chain_id: request.chain_id,
                expires_at_epoch_ms: challenge.payload.expires_at_epoch_ms,
                used: false,
            },
        );
    }

    debug!(%address, chain_id = %request.chain_id, "sign-in challenge issued");
    Ok(Json(challenge_response(&challenge)))
}

pub(crate) async fn auth_login(
    State(state): State<AppState>,
    Json(request): Json<AuthLoginRequest>,
) -> ApiResult<AuthLoginResponse> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message is required"));
    }

    if request.signature.trim().is_empty() {
        return Err(bad_request("signature is required"));
    }

    let payload = verify_login_signature(&request.message, &request.signature)
        .map_err(|err| unauthorized(&err.to_string()))?;
    if payload.domain != state.config.auth_domain {
        return Err(unauthorized("message was issued for another domain"));
    }

    let now = epoch_ms().map_err(internal_error)?;
    {
        let mut store = state.challenges.write().await;
        let record = store
            .get_mut(&payload.nonce)
            .ok_or_else(|| bad_request("challenge not found"))?;

        if record.used {
            return Err(bad_request("challenge already used"));
        }

        if now > record.expires_at_epoch_ms {
            record.used = true;
            return Err(bad_request("challenge expired"));
        }

        if record.address != payload.address || record.chain_id != payload.chain_id {
            return Err(bad_request("message does not match the challenge"));
        }

        record.used = true;
    }

    let address = payload.address.to_checksum(None);
    let (token, expires_at_epoch_ms) = state
        .tokens
        .issue(&address, TokenKind::User)
        .map_err(internal_error)?;

    info!(%address, chain_id = %payload.chain_id, "wallet signed in");
    Ok(Json(AuthLoginResponse {
        token,
        address,
        expires_at_epoch_ms,
    }))
}

pub(crate) async fn auth_user(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<AuthUserResponse> {
    let token = bearer_token(&headers)?;
    let claims = state
        .tokens
        .verify(token, TokenKind::User)
        .map_err(|err| unauthorized(&format!("{err:#}")))?;
    Ok(Json(AuthUserResponse { address: claims.sub }))
}
