//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from the IDP_CLIENT_SECRET env var or
//! client_secret_file, never stored in the TOML directly.

use common::Secret;
use idp::endpoints::DEFAULT_AUTHORITY_HOST;
use idp::{ClientApp, ProviderEndpoints};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_cache::RetryPolicy;

/// Env var holding the client secret; wins over `client_secret_file`.
pub const CLIENT_SECRET_ENV: &str = "IDP_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub identity: IdentityConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

/// Client registration at the identity provider
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub tenant_id: String,
    pub client_id: String,
    /// Audience of inbound access tokens, e.g. `api://token-broker`
    pub api_audience: String,
    pub redirect_uri: String,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    /// Scopes requested at login when the caller names none
    #[serde(default)]
    pub login_scopes: Vec<String>,
    /// Leeway applied to `exp`/`nbf` when verifying tokens
    #[serde(default)]
    pub clock_skew_secs: u64,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Token cache persistence
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one cache file per user
    pub dir: PathBuf,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// HTTP listener and outbound client settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Timeout for calls to the identity provider
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_pool_max_idle() -> usize {
    16
}

impl IdentityConfig {
    /// Configured login scopes, or email plus this API's `access` scope.
    pub fn login_scopes(&self) -> Vec<String> {
        if !self.login_scopes.is_empty() {
            return self.login_scopes.clone();
        }
        vec![
            "email".to_string(),
            format!("{}/access", self.api_audience.trim_end_matches('/')),
        ]
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. IDP_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        let identity = &config.identity;
        for (name, value) in [
            ("tenant_id", &identity.tenant_id),
            ("client_id", &identity.client_id),
            ("api_audience", &identity.api_audience),
            ("redirect_uri", &identity.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(common::Error::Config(format!("identity.{name} must not be empty")));
            }
        }

        if !identity.authority_host.starts_with("http://")
            && !identity.authority_host.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "authority_host must start with http:// or https://, got: {}",
                identity.authority_host
            )));
        }

        if config.store.retry_attempts == 0 {
            return Err(common::Error::Config(
                "retry_attempts must be greater than 0".into(),
            ));
        }

        if config.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // Resolve client secret: env var takes precedence over file
        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.identity.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.identity.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.identity.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    /// Client registration for the token client. Requires a client secret.
    pub fn client_app(&self) -> common::Result<ClientApp> {
        let identity = &self.identity;
        let client_secret = identity.client_secret.clone().ok_or_else(|| {
            common::Error::Config(format!(
                "no client secret: set {CLIENT_SECRET_ENV} or identity.client_secret_file"
            ))
        })?;
        Ok(ClientApp {
            client_id: identity.client_id.clone(),
            client_secret,
            redirect_uri: identity.redirect_uri.clone(),
            api_audience: identity.api_audience.clone(),
            endpoints: ProviderEndpoints::for_tenant(&identity.authority_host, &identity.tenant_id),
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-broker.toml")
    }
}
