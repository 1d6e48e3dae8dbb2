use anyhow::{Context, Result};
use std::time::Duration;

pub const GRACE_WINDOW_VAR: &str = "CK_GRACE_WINDOW_MS";
pub const CONNECT_TIMEOUT_VAR: &str = "CK_CONNECT_TIMEOUT_MS";
pub const PAIRING_POLL_VAR: &str = "CK_PAIRING_POLL_MS";
pub const AUTH_DOMAIN_VAR: &str = "CK_AUTH_DOMAIN";
pub const IS_MOBILE_VAR: &str = "CK_IS_MOBILE";

/// Tunables of the connect flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// A connect that settles within this window never shows the
    /// connecting screen.
    pub grace_window: Duration,
    /// `None` waits for the wallet indefinitely; the user can still back out.
    pub connect_timeout: Option<Duration>,
    pub pairing_poll_interval: Duration,
    /// Domain placed in sign-in messages.
    pub auth_domain: String,
    pub is_mobile: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_millis(100),
            connect_timeout: None,
            pairing_poll_interval: Duration::from_millis(500),
            auth_domain: "localhost".to_owned(),
            is_mobile: false,
        }
    }
}

impl ConnectConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with variables read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let millis = |name: &str| -> Result<Option<Duration>> {
            lookup(name)
                .filter(|raw| !raw.trim().is_empty())
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .with_context(|| format!("{name} must be a number of milliseconds, got {raw:?}"))
                })
                .transpose()
        };

        let is_mobile = match lookup(IS_MOBILE_VAR).as_deref().map(str::trim) {
            None | Some("") => defaults.is_mobile,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => anyhow::bail!("{IS_MOBILE_VAR} must be true or false, got {other:?}"),
        };

        Ok(Self {
            grace_window: millis(GRACE_WINDOW_VAR)?.unwrap_or(defaults.grace_window),
            connect_timeout: millis(CONNECT_TIMEOUT_VAR)?.filter(|timeout| !timeout.is_zero()),
            pairing_poll_interval: millis(PAIRING_POLL_VAR)?.unwrap_or(defaults.pairing_poll_interval),
            auth_domain: lookup(AUTH_DOMAIN_VAR)
                .filter(|domain| !domain.trim().is_empty())
                .unwrap_or(defaults.auth_domain),
            is_mobile,
        })
    }
}
