//! Authentication material and its transport configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use russh::keys::{decode_secret_key, PrivateKey, PublicKey};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Host-key verifier: `(addr, server key) -> accept`.
pub type HostKeyCheck = Arc<dyn Fn(&str, &PublicKey) -> bool + Send + Sync>;

/// Credential bundle for one class of hosts.
///
/// At least one of `password`, `private_key` (inline PEM) or
/// `private_key_file` must resolve, otherwise building the transport
/// configuration fails with [`Error::NoAuthMethod`]. Without a
/// `host_key_check` the server key is accepted unconditionally.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Auth {
    pub user: String,
    pub password: Option<String>,
    /// Private key material in OpenSSH/PEM form.
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub host_key_check: Option<HostKeyCheck>,
    /// Handshake timeout in milliseconds; `0` disables the timeout.
    pub timeout_ms: u64,
    /// Concurrent session channels per connection: `0` means the default
    /// of 10, negative disables the bound.
    pub max_session: i32,
    #[serde(skip)]
    config: OnceCell<Arc<TransportConfig>>,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("private_key_file", &self.private_key_file)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_session", &self.max_session)
            .finish()
    }
}

/// Ordered credentials to try during authentication.
pub(crate) enum Credential {
    Password(String),
    Key(Arc<PrivateKey>),
}

/// Built once from an [`Auth`] and cached on it.
pub(crate) struct TransportConfig {
    pub user: String,
    pub credentials: Vec<Credential>,
    pub timeout: Option<Duration>,
    pub host_key_check: Option<HostKeyCheck>,
}

impl Auth {
    pub fn with_user(user: impl Into<String>) -> Self {
        Auth {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn private_key(mut self, pem: impl Into<String>) -> Self {
        self.private_key = Some(pem.into());
        self
    }

    pub fn private_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    pub fn host_key_check(mut self, check: HostKeyCheck) -> Self {
        self.host_key_check = Some(check);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn max_session(mut self, n: i32) -> Self {
        self.max_session = n;
        self
    }

    /// The transport configuration, built on first use and cached.
    pub(crate) fn transport_config(&self) -> Result<Arc<TransportConfig>> {
        self.config
            .get_or_try_init(|| self.build_transport_config().map(Arc::new))
            .cloned()
    }

    /// Validates the descriptor by building (and caching) its
    /// configuration.
    pub fn validate(&self) -> Result<()> {
        self.transport_config().map(|_| ())
    }

    fn build_transport_config(&self) -> Result<TransportConfig> {
        let mut credentials = Vec::new();

        if let Some(password) = &self.password {
            if !password.is_empty() {
                credentials.push(Credential::Password(password.clone()));
            }
        }
        if let Some(pem) = &self.private_key {
            if !pem.is_empty() {
                let key = decode_secret_key(pem, None)
                    .map_err(|e| Error::KeyParseFailed(e.to_string()))?;
                credentials.push(Credential::Key(Arc::new(key)));
            }
        }
        if let Some(path) = &self.private_key_file {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                Error::KeyParseFailed(format!("invalid private key file: {}", e))
            })?;
            let key = decode_secret_key(&pem, None)
                .map_err(|e| Error::KeyParseFailed(e.to_string()))?;
            credentials.push(Credential::Key(Arc::new(key)));
        }

        if credentials.is_empty() {
            return Err(Error::NoAuthMethod);
        }

        let timeout = (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms));

        Ok(TransportConfig {
            user: self.user.clone(),
            credentials,
            timeout,
            host_key_check: self.host_key_check.clone(),
        })
    }
}
