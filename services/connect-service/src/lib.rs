//! Backend for ConnectKit apps: wallet sign-in, the email wallet's custodial
//! keys and the pairing relay used by QR wallets.

use axum::{
    Json, Router,
    http::{HeaderMap, Method, StatusCode, header},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ck_api_types::ErrorResponse;
use ck_storage::{InMemoryKeystore, Keystore};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

mod auth;
mod config;
mod embedded;
mod pairing;

pub use auth::{SessionClaims, SessionTokens, TokenKind};
pub use config::*;
pub use embedded::{LogOtpSender, OtpSender};

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);
pub(crate) type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub(crate) config: Arc<ServiceConfig>,
    pub(crate) tokens: Arc<SessionTokens>,
    pub(crate) challenges: Arc<RwLock<HashMap<String, auth::ChallengeRecord>>>,
    pub(crate) embedded: Arc<embedded::EmbeddedState>,
    pub(crate) pairings: Arc<RwLock<HashMap<String, pairing::PairingEntry>>>,
}

impl AppState {
    /// State with custodial keys kept in memory and one-time codes written
    /// to the log.
    pub fn in_memory(config: ServiceConfig) -> Self {
        Self::new(config, Arc::new(InMemoryKeystore::default()), Arc::new(LogOtpSender))
    }

    pub fn new(config: ServiceConfig, keystore: Arc<dyn Keystore>, otp_sender: Arc<dyn OtpSender>) -> Self {
        let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
            warn!("{JWT_SECRET_VAR} is not set; session tokens will not survive a restart");
            random_secret()
        });
        let encryption_key = config.encryption_key.clone().unwrap_or_else(|| {
            warn!("{ENCRYPTION_KEY_VAR} is not set; stored email wallets will not survive a restart");
            random_secret()
        });

        Self {
            tokens: Arc::new(SessionTokens::new(jwt_secret.as_bytes(), config.token_ttl)),
            challenges: Arc::new(RwLock::new(HashMap::new())),
            embedded: Arc::new(embedded::EmbeddedState::new(keystore, otp_sender, encryption_key)),
            pairings: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/auth/challenge", post(auth::auth_challenge))
        .route("/auth/login", post(auth::auth_login))
        .route("/auth/user", get(auth::auth_user))
        .route("/embedded/otp", post(embedded::embedded_otp))
        .route("/embedded/verify", post(embedded::embedded_verify))
        .route("/embedded/sign", post(embedded::embedded_sign))
        .route("/pairing", post(pairing::pairing_create))
        .route(
            "/pairing/{topic}",
            get(pairing::pairing_status).delete(pairing::pairing_cancel),
        )
        .route("/pairing/{topic}/approve", post(pairing::pairing_approve))
        .route("/pairing/{topic}/reject", post(pairing::pairing_reject))
        .route("/pairing/{topic}/requests", post(pairing::relay_request_create))
        .route("/pairing/{topic}/requests/{id}", get(pairing::relay_request_status))
        .route("/pairing/{topic}/requests/{id}/response", post(pairing::relay_request_respond))
        .route("/pairing/{topic}/pending", get(pairing::relay_pending))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "connect-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "connect-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn random_secret() -> String {
    let mut bytes = [0_u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing Authorization header"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| unauthorized("invalid Authorization format"))?;
    Ok(token)
}

fn error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn bad_request(message: &str) -> ApiError {
    error(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn unauthorized(message: &str) -> ApiError {
    error(StatusCode::UNAUTHORIZED, message)
}

pub(crate) fn not_found(message: &str) -> ApiError {
    error(StatusCode::NOT_FOUND, message)
}

pub(crate) fn conflict(message: &str) -> ApiError {
    error(StatusCode::CONFLICT, message)
}

pub(crate) fn internal_error(err: impl std::fmt::Display) -> ApiError {
    error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Keeps every code instead of mailing it.
    #[derive(Default)]
    pub(crate) struct RecordingOtpSender {
        pub(crate) sent: Mutex<Vec<(String, String)>>,
    }

    impl OtpSender for RecordingOtpSender {
        fn deliver(&self, email: &str, code: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((email.to_owned(), code.to_owned()));
            Ok(())
        }
    }

    impl RecordingOtpSender {
        pub(crate) fn last_code(&self) -> Option<String> {
            self.sent.lock().unwrap().last().map(|(_, code)| code.clone())
        }
    }

    pub(crate) fn state() -> (AppState, Arc<RecordingOtpSender>) {
        let sender = Arc::new(RecordingOtpSender::default());
        let config = ServiceConfig {
            auth_domain: "dapp.test".to_owned(),
            public_url: "http://relay.test".to_owned(),
            jwt_secret: Some("test-secret".to_owned()),
            encryption_key: Some("test-encryption-key".to_owned()),
            ..ServiceConfig::default()
        };
        let state = AppState::new(config, Arc::new(InMemoryKeystore::default()), sender.clone());
        (state, sender)
    }

    pub(crate) async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<(StatusCode, serde_json::Value)> {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => request.body(Body::empty())?,
        };

        let response = app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }

    pub(crate) fn parse<T: DeserializeOwned>(value: serde_json::Value) -> anyhow::Result<T> {
        Ok(serde_json::from_value(value)?)
    }
}
