use ck_api_types::AuthLoginResponse;
use ck_auth_adapter::{AuthBackend, SignInError, login};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::ConnectionSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Idle,
    Signing,
    Done,
    /// Sign-in failed; the message is shown next to a retry button.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("a sign-in is already in progress")]
    Busy,
    #[error("no wallet is connected")]
    NotConnected,
    #[error("nothing to retry")]
    NothingToRetry,
    #[error(transparent)]
    SignIn(#[from] SignInError),
}

type DoneCallback = Arc<dyn Fn(&AuthLoginResponse) + Send + Sync>;

struct FlowInner {
    backend: Arc<dyn AuthBackend>,
    status: watch::Sender<SignatureStatus>,
    on_done: Mutex<Option<DoneCallback>>,
}

/// Sign-in with the connected wallet after it is connected.
///
/// A failed sign-in leaves the wallet connected; only the flow's status
/// changes.
#[derive(Clone)]
pub struct SignatureFlow {
    inner: Arc<FlowInner>,
}

impl SignatureFlow {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        let (status, _) = watch::channel(SignatureStatus::Idle);
        Self {
            inner: Arc::new(FlowInner {
                backend,
                status,
                on_done: Mutex::new(None),
            }),
        }
    }

    /// Called with the backend's response once a signature is accepted.
    #[must_use]
    pub fn on_done(self, callback: impl Fn(&AuthLoginResponse) + Send + Sync + 'static) -> Self {
        *self.inner.on_done.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
        self
    }

    pub fn status(&self) -> SignatureStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SignatureStatus> {
        self.inner.status.subscribe()
    }

    pub async fn sign_in(&self, session: &ConnectionSession) -> Result<AuthLoginResponse, SignatureError> {
        let connector = session.active_connector().ok_or(SignatureError::NotConnected)?;
        let started = self.inner.status.send_if_modified(|status| {
            if *status == SignatureStatus::Signing {
                false
            } else {
                *status = SignatureStatus::Signing;
                true
            }
        });
        if !started {
            return Err(SignatureError::Busy);
        }

        let result = async {
            let signer = connector.signer().await.map_err(|err| SignInError::Backend(err.to_string()))?;
            let chain_id = connector.chain_id().await.map_err(|err| SignInError::Backend(err.to_string()))?;
            login(self.inner.backend.as_ref(), signer.as_ref(), chain_id).await
        }
        .await;

        match result {
            Ok(response) => {
                info!(address = %response.address, "sign-in accepted");
                self.inner.status.send_replace(SignatureStatus::Done);
                let callback = self.inner.on_done.lock().unwrap_or_else(PoisonError::into_inner).clone();
                if let Some(callback) = callback {
                    callback(&response);
                }
                Ok(response)
            }
            Err(err) => {
                warn!(error = %err, "sign-in failed");
                self.inner.status.send_replace(SignatureStatus::Failed(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Signs in again after a failure.
    pub async fn retry(&self, session: &ConnectionSession) -> Result<AuthLoginResponse, SignatureError> {
        if !matches!(self.status(), SignatureStatus::Failed(_)) {
            return Err(SignatureError::NothingToRetry);
        }
        self.sign_in(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{injected_connector, injected_wallet};
    use alloy_primitives::Address;
    use anyhow::Result;
    use async_trait::async_trait;
    use ck_api_types::{AuthChallengeResponse, AuthLoginRequest, ChainId, WalletId};
    use ck_auth_adapter::{challenge_response, issue_challenge, verify_login_signature};
    use ck_connectors::ConnectParams;
    use ck_storage::InMemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the first `failures` logins, then verifies signatures for real.
    struct FlakyBackend {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl AuthBackend for FlakyBackend {
        async fn challenge(&self, address: Address, chain_id: ChainId) -> anyhow::Result<AuthChallengeResponse> {
            Ok(challenge_response(&issue_challenge("dapp.test", address, chain_id, 300)?))
        }

        async fn login(&self, request: AuthLoginRequest) -> anyhow::Result<AuthLoginResponse> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("service unavailable");
            }
            let payload = verify_login_signature(&request.message, &request.signature)?;
            Ok(AuthLoginResponse {
                token: format!("token-{}", payload.nonce),
                address: payload.address.to_checksum(None),
                expires_at_epoch_ms: payload.expires_at_epoch_ms,
            })
        }
    }

    async fn connected_session() -> Result<(ConnectionSession, Address)> {
        let session = ConnectionSession::new(Arc::new(InMemorySessionStore::default()));
        let connector = injected_connector(injected_wallet());
        let address = connector.connect(ConnectParams::default()).await?;
        session.activate(WalletId::from("metamask"), connector).await?;
        Ok((session, address))
    }

    #[tokio::test]
    async fn failure_then_retry_calls_on_done_once() -> Result<()> {
        let (session, address) = connected_session().await?;
        let done = Arc::new(Mutex::new(Vec::new()));
        let seen = done.clone();
        let flow = SignatureFlow::new(Arc::new(FlakyBackend {
            failures: AtomicUsize::new(1),
        }))
        .on_done(move |response| seen.lock().unwrap().push(response.token.clone()));

        assert_eq!(flow.status(), SignatureStatus::Idle);
        let err = flow.sign_in(&session).await.unwrap_err();
        assert!(matches!(err, SignatureError::SignIn(SignInError::Backend(_))));
        assert!(matches!(flow.status(), SignatureStatus::Failed(_)));
        assert!(done.lock().unwrap().is_empty());
        assert!(session.account().is_some(), "failed sign-in keeps the wallet connected");

        let response = flow.retry(&session).await?;
        assert_eq!(response.address, address.to_checksum(None));
        assert_eq!(flow.status(), SignatureStatus::Done);
        assert_eq!(done.lock().unwrap().as_slice(), [response.token]);
        Ok(())
    }

    #[tokio::test]
    async fn retry_needs_a_failure_and_sign_in_needs_a_wallet() -> Result<()> {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicUsize::new(0),
        });
        let flow = SignatureFlow::new(backend);
        let empty = ConnectionSession::new(Arc::new(InMemorySessionStore::default()));

        assert!(matches!(flow.sign_in(&empty).await, Err(SignatureError::NotConnected)));
        assert_eq!(flow.status(), SignatureStatus::Idle);

        let (session, _) = connected_session().await?;
        assert!(matches!(flow.retry(&session).await, Err(SignatureError::NothingToRetry)));
        flow.sign_in(&session).await?;
        assert_eq!(flow.status(), SignatureStatus::Done);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_signature_is_reported_as_failure() -> Result<()> {
        let session = ConnectionSession::new(Arc::new(InMemorySessionStore::default()));
        let wallet = injected_wallet();
        let connector = injected_connector(wallet.clone());
        connector.connect(ConnectParams::default()).await?;
        session.activate(WalletId::from("metamask"), connector.clone()).await?;
        wallet.set_approval(ck_provider::Approval::Reject);

        let flow = SignatureFlow::new(Arc::new(FlakyBackend {
            failures: AtomicUsize::new(0),
        }));
        let err = flow.sign_in(&session).await.unwrap_err();
        assert!(matches!(err, SignatureError::SignIn(SignInError::Rejected(_))));
        assert!(connector.is_connected().await);
        Ok(())
    }
}
