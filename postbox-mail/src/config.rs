use std::{fmt, path::PathBuf};

use serde::Deserialize;

use crate::error::RelayError;

/// Upstream relay settings
///
/// ```toml
/// [relay]
/// host = "smtp.sendgrid.net"
/// port = 587
/// api_key = "SG.xxxx"
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// TLS from the first byte. When `false`, STARTTLS is used if offered.
    pub secure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Used as the password when `password` is not set
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            secure: false,
            username: None,
            password: None,
            api_key: None,
            timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &mask(self.password.as_deref()))
            .field("api_key", &mask(self.api_key.as_deref()))
            .field("timeout_secs", &self.timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// `None`, or the secret with everything but its last four characters hidden
#[must_use]
pub fn mask(secret: Option<&str>) -> Option<String> {
    secret.map(|secret| {
        let count = secret.chars().count();
        let visible: String = secret.chars().skip(count.saturating_sub(4)).collect();
        if count <= 4 {
            "****".to_string()
        } else {
            format!("****{visible}")
        }
    })
}

impl RelayConfig {
    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the username and password to authenticate with.
    ///
    /// The password is `password`, else `api_key`. With an API key and no
    /// username, the username is `apikey`.
    pub fn credentials(&self) -> Result<(String, String), RelayError> {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());

        let username = non_empty(&self.username);
        let (username, password) = match (non_empty(&self.password), non_empty(&self.api_key)) {
            (Some(password), _) => (username, password),
            (None, Some(key)) => (username.or_else(|| Some("apikey".to_string())), key),
            (None, None) => (username, String::new()),
        };

        match username {
            Some(username) if !password.is_empty() => Ok((username, password)),
            _ => Err(RelayError::Configuration(
                "relay credentials not configured: set relay username and password, or an api_key"
                    .to_string(),
            )),
        }
    }
}

/// DKIM signing settings
///
/// ```toml
/// [dkim]
/// domain = "example.com"
/// selector = "mail"
/// private_key = "/etc/postbox/dkim.pem"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DkimConfig {
    pub domain: String,
    pub selector: String,
    /// Path to a PKCS#8 (or PKCS#1) PEM encoded RSA key
    pub private_key: PathBuf,
}
