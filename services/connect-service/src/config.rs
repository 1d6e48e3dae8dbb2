use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

pub const BIND_ADDR_VAR: &str = "CK_BIND_ADDR";
pub const PUBLIC_URL_VAR: &str = "CK_PUBLIC_URL";
pub const AUTH_DOMAIN_VAR: &str = "CK_AUTH_DOMAIN";
pub const JWT_SECRET_VAR: &str = "CK_JWT_SECRET";
pub const ENCRYPTION_KEY_VAR: &str = "CK_ENCRYPTION_KEY";
pub const DATA_DIR_VAR: &str = "CK_DATA_DIR";
pub const CHALLENGE_TTL_VAR: &str = "CK_CHALLENGE_TTL_SECS";
pub const OTP_TTL_VAR: &str = "CK_OTP_TTL_SECS";
pub const PAIRING_TTL_VAR: &str = "CK_PAIRING_TTL_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    /// Base URL wallets use to reach the pairing relay.
    pub public_url: String,
    /// Sign-in messages must name this domain.
    pub auth_domain: String,
    /// HS256 secret for session tokens. Unset means a random secret per process.
    pub jwt_secret: Option<String>,
    /// Wraps custodial keys at rest. Unset means a random key per process.
    pub encryption_key: Option<String>,
    /// RocksDB directory for custodial keys; used with the `rocksdb` feature.
    pub data_dir: Option<String>,
    pub challenge_ttl: Duration,
    pub otp_ttl: Duration,
    pub pairing_ttl: Duration,
    pub token_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], 8080));
        Self {
            bind_addr,
            public_url: format!("http://localhost:{}", bind_addr.port()),
            auth_domain: "localhost".to_owned(),
            jwt_secret: None,
            encryption_key: None,
            data_dir: None,
            challenge_ttl: Duration::from_secs(300),
            otp_ttl: Duration::from_secs(600),
            pairing_ttl: Duration::from_secs(300),
            token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let value = |name: &str| lookup(name).map(|raw| raw.trim().to_owned()).filter(|raw| !raw.is_empty());
        let seconds = |name: &str, default: Duration| -> Result<Duration> {
            value(name)
                .map(|raw| {
                    raw.parse::<u64>()
                        .map(Duration::from_secs)
                        .with_context(|| format!("{name} must be a number of seconds, got {raw:?}"))
                })
                .transpose()
                .map(|parsed| parsed.unwrap_or(default))
        };

        let bind_addr = match value(BIND_ADDR_VAR) {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .with_context(|| format!("{BIND_ADDR_VAR} must be host:port, got {raw:?}"))?,
            None => defaults.bind_addr,
        };

        Ok(Self {
            bind_addr,
            public_url: value(PUBLIC_URL_VAR)
                .map(|url| url.trim_end_matches('/').to_owned())
                .unwrap_or_else(|| format!("http://localhost:{}", bind_addr.port())),
            auth_domain: value(AUTH_DOMAIN_VAR).unwrap_or(defaults.auth_domain),
            jwt_secret: value(JWT_SECRET_VAR),
            encryption_key: value(ENCRYPTION_KEY_VAR),
            data_dir: value(DATA_DIR_VAR),
            challenge_ttl: seconds(CHALLENGE_TTL_VAR, defaults.challenge_ttl)?,
            otp_ttl: seconds(OTP_TTL_VAR, defaults.otp_ttl)?,
            pairing_ttl: seconds(PAIRING_TTL_VAR, defaults.pairing_ttl)?,
            token_ttl: defaults.token_ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_listen_on_8080() -> Result<()> {
        let config = ServiceConfig::from_lookup(lookup(&[]))?;
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.public_url, "http://localhost:8080");
        assert_eq!(config.jwt_secret, None);
        Ok(())
    }

    #[test]
    fn public_url_follows_bind_port_unless_set() -> Result<()> {
        let config = ServiceConfig::from_lookup(lookup(&[(BIND_ADDR_VAR, "127.0.0.1:9100"), (OTP_TTL_VAR, "60")]))?;
        assert_eq!(config.public_url, "http://localhost:9100");
        assert_eq!(config.otp_ttl, Duration::from_secs(60));

        let config = ServiceConfig::from_lookup(lookup(&[(PUBLIC_URL_VAR, "https://relay.example/")]))?;
        assert_eq!(config.public_url, "https://relay.example");
        Ok(())
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(ServiceConfig::from_lookup(lookup(&[(BIND_ADDR_VAR, "port 80")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[(PAIRING_TTL_VAR, "5m")])).is_err());
    }
}
