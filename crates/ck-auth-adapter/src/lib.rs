use alloy_primitives::{Address, hex};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use ck_api_types::{AuthChallengeResponse, AuthLoginRequest, AuthLoginResponse, ChainId};
use ck_provider::{MessageSigner, ProviderError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;

const HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";
const STATEMENT: &str = "Please ensure that the domain above matches the URL of the current website.";

/// Fields of the sign-in message a wallet is asked to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPayload {
    pub domain: String,
    pub address: Address,
    pub chain_id: ChainId,
    pub nonce: String,
    pub issued_at_epoch_ms: u128,
    pub expires_at_epoch_ms: u128,
}

#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub payload: LoginPayload,
    pub expires_in_seconds: u64,
}

pub fn issue_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn issue_challenge(domain: &str, address: Address, chain_id: ChainId, expires_in_seconds: u64) -> Result<PendingChallenge> {
    let issued_at_epoch_ms = epoch_ms()?;
    Ok(PendingChallenge {
        payload: LoginPayload {
            domain: domain.to_owned(),
            address,
            chain_id,
            nonce: issue_nonce(),
            issued_at_epoch_ms,
            expires_at_epoch_ms: issued_at_epoch_ms + u128::from(expires_in_seconds) * 1000,
        },
        expires_in_seconds,
    })
}

pub fn challenge_response(challenge: &PendingChallenge) -> AuthChallengeResponse {
    AuthChallengeResponse {
        message: build_login_message(&challenge.payload),
        nonce: challenge.payload.nonce.clone(),
        expires_in: challenge.expires_in_seconds,
    }
}

pub fn build_login_message(payload: &LoginPayload) -> String {
    format!(
        "{domain}{HEADER_SUFFIX}\n{address}\n\n{STATEMENT}\n\nVersion: 1\nChain ID: {chain}\nNonce: {nonce}\nIssued At: {issued}\nExpiration Time: {expires}",
        domain = payload.domain,
        address = payload.address.to_checksum(None),
        chain = payload.chain_id,
        nonce = payload.nonce,
        issued = payload.issued_at_epoch_ms,
        expires = payload.expires_at_epoch_ms,
    )
}

pub fn parse_login_message(message: &str) -> Result<LoginPayload> {
    let mut lines = message.lines();

    let header = lines.next().ok_or_else(|| anyhow!("empty login message"))?;
    let domain = header
        .strip_suffix(HEADER_SUFFIX)
        .ok_or_else(|| anyhow!("invalid login message header"))?
        .to_owned();

    let address = lines
        .next()
        .ok_or_else(|| anyhow!("missing address line"))?
        .trim()
        .parse::<Address>()
        .map_err(|err| anyhow!("invalid address: {err}"))?;

    let mut chain_id = None;
    let mut nonce = None;
    let mut issued_at = None;
    let mut expires_at = None;
    for line in lines {
        if let Some(value) = line.strip_prefix("Chain ID: ") {
            chain_id = Some(ChainId(value.trim().parse()?));
        } else if let Some(value) = line.strip_prefix("Nonce: ") {
            nonce = Some(value.trim().to_owned());
        } else if let Some(value) = line.strip_prefix("Issued At: ") {
            issued_at = Some(value.trim().parse::<u128>()?);
        } else if let Some(value) = line.strip_prefix("Expiration Time: ") {
            expires_at = Some(value.trim().parse::<u128>()?);
        }
    }

    Ok(LoginPayload {
        domain,
        address,
        chain_id: chain_id.ok_or_else(|| anyhow!("missing Chain ID"))?,
        nonce: nonce.filter(|n| !n.is_empty()).ok_or_else(|| anyhow!("missing Nonce"))?,
        issued_at_epoch_ms: issued_at.ok_or_else(|| anyhow!("missing Issued At"))?,
        expires_at_epoch_ms: expires_at.ok_or_else(|| anyhow!("missing Expiration Time"))?,
    })
}

/// Parses the message and checks the signature was produced by the address
/// named in it.
pub fn verify_login_signature(message: &str, signature: &str) -> Result<LoginPayload> {
    if message.trim().is_empty() || signature.trim().is_empty() {
        return Err(anyhow!("message and signature are required"));
    }

    let payload = parse_login_message(message)?;
    let signature_bytes = hex::decode(signature).map_err(|err| anyhow!("invalid signature hex: {err}"))?;
    let recovered = ck_crypto::recover_address(message.as_bytes(), &signature_bytes)?;
    if recovered != payload.address {
        return Err(anyhow!("signature does not match {}", payload.address));
    }
    Ok(payload)
}

/// Remote sign-in endpoint.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn challenge(&self, address: Address, chain_id: ChainId) -> Result<AuthChallengeResponse>;
    async fn login(&self, request: AuthLoginRequest) -> Result<AuthLoginResponse>;
}

#[derive(Debug, thiserror::Error)]
pub enum SignInError {
    #[error("signature request rejected: {0}")]
    Rejected(#[source] ProviderError),
    #[error("challenge does not match the connected account")]
    ChallengeMismatch,
    #[error("auth backend error: {0}")]
    Backend(String),
}

/// Challenge/response sign-in. Returns only once the backend has accepted the
/// signature.
pub async fn login(
    backend: &dyn AuthBackend,
    signer: &dyn MessageSigner,
    chain_id: ChainId,
) -> Result<AuthLoginResponse, SignInError> {
    let address = signer.address();
    let challenge = backend
        .challenge(address, chain_id)
        .await
        .map_err(|err| SignInError::Backend(format!("{err:#}")))?;

    let payload = parse_login_message(&challenge.message).map_err(|err| SignInError::Backend(format!("{err:#}")))?;
    if payload.address != address || payload.chain_id != chain_id || payload.nonce != challenge.nonce {
        warn!(%address, "refusing to sign a challenge issued for another account");
        return Err(SignInError::ChallengeMismatch);
    }

    let signature = signer
        .sign_message(challenge.message.as_bytes())
        .await
        .map_err(SignInError::Rejected)?;

    let response = backend
        .login(AuthLoginRequest {
            message: challenge.message,
            signature,
        })
        .await
        .map_err(|err| SignInError::Backend(format!("{err:#}")))?;

    info!(%address, "signed in");
    Ok(response)
}

pub fn epoch_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| anyhow!("time error: {err}"))?
        .as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_crypto::LocalSigner;

    struct KeySigner(LocalSigner);

    #[async_trait]
    impl MessageSigner for KeySigner {
        fn address(&self) -> Address {
            self.0.address()
        }

        async fn sign_message(&self, message: &[u8]) -> Result<String, ProviderError> {
            let signature = self
                .0
                .sign_message(message)
                .map_err(|err| ProviderError::internal(err.to_string()))?;
            Ok(hex::encode_prefixed(signature))
        }
    }

    /// Issues challenges and verifies them with the same helpers the service uses.
    struct VerifyingBackend {
        domain: String,
        issued_for: Option<Address>,
    }

    #[async_trait]
    impl AuthBackend for VerifyingBackend {
        async fn challenge(&self, address: Address, chain_id: ChainId) -> Result<AuthChallengeResponse> {
            let challenge = issue_challenge(&self.domain, self.issued_for.unwrap_or(address), chain_id, 300)?;
            Ok(challenge_response(&challenge))
        }

        async fn login(&self, request: AuthLoginRequest) -> Result<AuthLoginResponse> {
            let payload = verify_login_signature(&request.message, &request.signature)?;
            Ok(AuthLoginResponse {
                token: format!("token-for-{}", payload.address),
                address: payload.address.to_checksum(None),
                expires_at_epoch_ms: payload.expires_at_epoch_ms,
            })
        }
    }

    #[test]
    fn login_message_roundtrips_through_parser() -> Result<()> {
        let challenge = issue_challenge("app.example", LocalSigner::new_random().address(), ChainId::BASE, 60)?;
        let message = build_login_message(&challenge.payload);
        assert!(message.starts_with("app.example wants you to sign in"));
        assert_eq!(parse_login_message(&message)?, challenge.payload);
        Ok(())
    }

    #[test]
    fn signature_from_other_key_is_rejected() -> Result<()> {
        let owner = LocalSigner::new_random();
        let other = LocalSigner::new_random();
        let challenge = issue_challenge("app.example", owner.address(), ChainId::MAINNET, 60)?;
        let message = build_login_message(&challenge.payload);

        let good = hex::encode_prefixed(owner.sign_message(message.as_bytes())?);
        let bad = hex::encode_prefixed(other.sign_message(message.as_bytes())?);
        assert!(verify_login_signature(&message, &good).is_ok());
        assert!(verify_login_signature(&message, &bad).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn login_signs_challenge_and_returns_token() -> Result<()> {
        let signer = KeySigner(LocalSigner::new_random());
        let backend = VerifyingBackend {
            domain: "app.example".to_owned(),
            issued_for: None,
        };

        let response = login(&backend, &signer, ChainId::MAINNET).await?;
        assert_eq!(response.address, signer.address().to_checksum(None));
        Ok(())
    }

    #[tokio::test]
    async fn login_refuses_challenge_for_other_account() {
        let signer = KeySigner(LocalSigner::new_random());
        let backend = VerifyingBackend {
            domain: "app.example".to_owned(),
            issued_for: Some(LocalSigner::new_random().address()),
        };

        let err = login(&backend, &signer, ChainId::MAINNET).await.unwrap_err();
        assert!(matches!(err, SignInError::ChallengeMismatch));
    }
}
