use alloy_primitives::hex;
use anyhow::{Context, Result};
use axum::{Json, extract::State, http::HeaderMap};
use ck_api_types::{
    EmbeddedOtpRequest, EmbeddedOtpResponse, EmbeddedSignRequest, EmbeddedSignResponse, EmbeddedVerifyRequest,
    EmbeddedVerifyResponse,
};
use ck_crypto::{LocalSigner, decrypt_key_material, encrypt_key_material};
use ck_storage::Keystore;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::auth::TokenKind;
use crate::{AppState, ApiResult, bad_request, bearer_token, internal_error, unauthorized};

const MAX_OTP_ATTEMPTS: u32 = 5;

/// Delivers one-time codes to the user's inbox.
pub trait OtpSender: Send + Sync {
    fn deliver(&self, email: &str, code: &str) -> Result<()>;
}

/// Writes codes to the service log. For local development only.
pub struct LogOtpSender;

impl OtpSender for LogOtpSender {
    fn deliver(&self, email: &str, code: &str) -> Result<()> {
        info!(%email, %code, "one-time code issued (no mail transport configured)");
        Ok(())
    }
}

struct OtpRecord {
    code: String,
    expires_at: Instant,
    attempts: u32,
}

pub(crate) struct EmbeddedState {
    keystore: Arc<dyn Keystore>,
    otp_sender: Arc<dyn OtpSender>,
    encryption_key: String,
    codes: RwLock<HashMap<String, OtpRecord>>,
    key_lock: Mutex<()>,
}

impl EmbeddedState {
    pub(crate) fn new(keystore: Arc<dyn Keystore>, otp_sender: Arc<dyn OtpSender>, encryption_key: String) -> Self {
        Self {
            keystore,
            otp_sender,
            encryption_key,
            codes: RwLock::new(HashMap::new()),
            key_lock: Mutex::new(()),
        }
    }

    async fn load_signer(&self, email: &str) -> Result<Option<LocalSigner>> {
        let Some(encrypted) = self.keystore.load_encrypted_key(&key_slot(email)).await? else {
            return Ok(None);
        };
        let mut secret = decrypt_key_material(&encrypted, &self.encryption_key).context("failed to unwrap custodial key")?;
        let signer = LocalSigner::from_secret_key_bytes(secret);
        secret.fill(0);
        signer.map(Some)
    }

    /// The user's custodial key, created on first sign-in.
    async fn signer_for(&self, email: &str) -> Result<LocalSigner> {
        let _guard = self.key_lock.lock().await;
        if let Some(signer) = self.load_signer(email).await? {
            return Ok(signer);
        }

        let signer = LocalSigner::new_random();
        let mut secret = signer.secret_key_bytes();
        let encrypted = encrypt_key_material(&secret, &self.encryption_key);
        secret.fill(0);
        self.keystore
            .save_encrypted_key(&key_slot(email), encrypted.context("failed to wrap custodial key")?)
            .await?;
        info!(%email, address = %signer.address(), "custodial wallet created");
        Ok(signer)
    }
}

fn key_slot(email: &str) -> String {
    format!("embedded:{email}")
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn generate_otp() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

pub(crate) async fn embedded_otp(
    State(state): State<AppState>,
    Json(request): Json<EmbeddedOtpRequest>,
) -> ApiResult<EmbeddedOtpResponse> {
    let email = normalize_email(&request.email);
    if email.is_empty() || !email.contains('@') {
        return Err(bad_request("a valid email is required"));
    }

    let code = generate_otp();
    let ttl = state.config.otp_ttl;
    {
        let mut codes = state.embedded.codes.write().await;
        let now = Instant::now();
        codes.retain(|_, record| record.expires_at > now);
        codes.insert(
            email.clone(),
            OtpRecord {
                code: code.clone(),
                expires_at: now + ttl,
                attempts: 0,
            },
        );
    }

    state.embedded.otp_sender.deliver(&email, &code).map_err(internal_error)?;
    debug!(%email, "one-time code sent");
    Ok(Json(EmbeddedOtpResponse {
        sent: true,
        expires_in: ttl.as_secs(),
    }))
}

pub(crate) async fn embedded_verify(
    State(state): State<AppState>,
    Json(request): Json<EmbeddedVerifyRequest>,
) -> ApiResult<EmbeddedVerifyResponse> {
    let email = normalize_email(&request.email);
    if request.otp.trim().is_empty() {
        return Err(bad_request("otp is required"));
    }

    {
        let mut codes = state.embedded.codes.write().await;
        let record = codes.get_mut(&email).ok_or_else(|| unauthorized("invalid code"))?;
        if Instant::now() > record.expires_at {
            codes.remove(&email);
            return Err(unauthorized("code expired"));
        }
        if record.code != request.otp.trim() {
            record.attempts += 1;
            if record.attempts >= MAX_OTP_ATTEMPTS {
                codes.remove(&email);
            }
            return Err(unauthorized("invalid code"));
        }
        codes.remove(&email);
    }

    let signer = state.embedded.signer_for(&email).await.map_err(internal_error)?;
    let (token, _) = state
        .tokens
        .issue(&email, TokenKind::Embedded)
        .map_err(internal_error)?;

    info!(%email, address = %signer.address(), "email wallet signed in");
    Ok(Json(EmbeddedVerifyResponse {
        address: signer.address().to_checksum(None),
        token,
    }))
}

pub(crate) async fn embedded_sign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmbeddedSignRequest>,
) -> ApiResult<EmbeddedSignResponse> {
    let token = bearer_token(&headers)?;
    let claims = state
        .tokens
        .verify(token, TokenKind::Embedded)
        .map_err(|err| unauthorized(&format!("{err:#}")))?;

    let message = hex::decode(request.message_hex.trim())
        .map_err(|err| bad_request(&format!("invalid message_hex: {err}")))?;

    let signer = state
        .embedded
        .load_signer(&claims.sub)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| unauthorized("no wallet for this session"))?;
    let signature = signer.sign_message(&message).map_err(internal_error)?;

    debug!(email = %claims.sub, bytes = message.len(), "message signed with custodial key");
    Ok(Json(EmbeddedSignResponse {
        signature: hex::encode_prefixed(signature),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use crate::testing::{call, parse, state};
    use axum::http::{Method, StatusCode};
    use ck_crypto::recover_address;
    use serde_json::json;

    async fn sign_in(app: &axum::Router, code: &str, email: &str) -> anyhow::Result<(StatusCode, serde_json::Value)> {
        call(
            app,
            Method::POST,
            "/embedded/verify",
            None,
            Some(json!({ "email": email, "otp": code })),
        )
        .await
    }

    #[tokio::test]
    async fn code_login_creates_wallet_once_and_signs() -> anyhow::Result<()> {
        let (state, sender) = state();
        let app = router(state);

        let (status, body) = call(&app, Method::POST, "/embedded/otp", None, Some(json!({ "email": "Ada@Example.com" }))).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expires_in"], 600);
        let code = sender.last_code().context("code delivered")?;

        let (status, body) = sign_in(&app, &code, "ada@example.com").await?;
        assert_eq!(status, StatusCode::OK);
        let first: EmbeddedVerifyResponse = parse(body)?;

        let message = b"gm";
        let (status, body) = call(
            &app,
            Method::POST,
            "/embedded/sign",
            Some(&first.token),
            Some(json!({ "message_hex": hex::encode_prefixed(message) })),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        let signed: EmbeddedSignResponse = parse(body)?;
        let recovered = recover_address(message, &hex::decode(&signed.signature)?)?;
        assert_eq!(recovered.to_checksum(None), first.address);

        // Same inbox, same wallet.
        call(&app, Method::POST, "/embedded/otp", None, Some(json!({ "email": "ada@example.com" }))).await?;
        let code = sender.last_code().context("second code")?;
        let (_, body) = sign_in(&app, &code, "ada@example.com").await?;
        let second: EmbeddedVerifyResponse = parse(body)?;
        assert_eq!(second.address, first.address);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_code_is_unauthorized_and_code_is_single_use() -> anyhow::Result<()> {
        let (state, sender) = state();
        let app = router(state);
        call(&app, Method::POST, "/embedded/otp", None, Some(json!({ "email": "bob@example.com" }))).await?;
        let code = sender.last_code().context("code delivered")?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let (status, _) = sign_in(&app, wrong, "bob@example.com").await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = sign_in(&app, &code, "bob@example.com").await?;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = sign_in(&app, &code, "bob@example.com").await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn too_many_wrong_codes_burn_the_code() -> anyhow::Result<()> {
        let (state, sender) = state();
        let app = router(state);
        call(&app, Method::POST, "/embedded/otp", None, Some(json!({ "email": "eve@example.com" }))).await?;
        let code = sender.last_code().context("code delivered")?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..MAX_OTP_ATTEMPTS {
            sign_in(&app, wrong, "eve@example.com").await?;
        }
        let (status, _) = sign_in(&app, &code, "eve@example.com").await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_code_is_refused() -> anyhow::Result<()> {
        let (state, sender) = state();
        let ttl = state.config.otp_ttl;
        let app = router(state);
        call(&app, Method::POST, "/embedded/otp", None, Some(json!({ "email": "ada@example.com" }))).await?;
        let code = sender.last_code().context("code delivered")?;

        tokio::time::advance(ttl + std::time::Duration::from_secs(1)).await;
        let (status, body) = sign_in(&app, &code, "ada@example.com").await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "code expired");
        Ok(())
    }

    #[tokio::test]
    async fn invalid_email_and_missing_token_are_refused() -> anyhow::Result<()> {
        let (state, _) = state();
        let (user_token, _) = state.tokens.issue("0xabc", TokenKind::User)?;
        let app = router(state);

        let (status, _) = call(&app, Method::POST, "/embedded/otp", None, Some(json!({ "email": "nobody" }))).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body = json!({ "message_hex": "0x676d" });
        let (status, _) = call(&app, Method::POST, "/embedded/sign", None, Some(body.clone())).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, Method::POST, "/embedded/sign", Some(&user_token), Some(body)).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
