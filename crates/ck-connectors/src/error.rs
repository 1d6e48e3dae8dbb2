use ck_api_types::ChainId;
use ck_provider::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("user rejected the request")]
    UserRejected,
    #[error("chain {chain_id} is not configured: {reason}")]
    ChainNotConfigured { chain_id: ChainId, reason: String },
    #[error("{wallet} is not available on chain {chain_id}")]
    UnsupportedChain { wallet: String, chain_id: ChainId },
    #[error("wallet is not installed")]
    NotInstalled,
    #[error("wallet is not connected")]
    NotConnected,
    #[error("wallet has not authorized this app")]
    NotAuthorized,
    #[error("a connected personal wallet is required")]
    PersonalWalletRequired,
    #[error("missing connect parameter: {0}")]
    MissingParameter(&'static str),
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("connection timed out")]
    Timeout,
    #[error("invalid password")]
    InvalidPassword,
    #[error("invalid or expired one-time code")]
    InvalidOtp,
    #[error(transparent)]
    Provider(ProviderError),
    #[error("backend error: {0}")]
    Backend(String),
}

impl ConnectorError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn is_user_rejected(&self) -> bool {
        matches!(self, Self::UserRejected)
    }
}

impl From<ProviderError> for ConnectorError {
    fn from(err: ProviderError) -> Self {
        if err.is_user_rejected() {
            Self::UserRejected
        } else {
            Self::Provider(err)
        }
    }
}
