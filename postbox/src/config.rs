//! `postbox.toml` loading and environment overrides.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use postbox_common::internal;
use postbox_mail::{DkimConfig, RelayConfig};
use postbox_smtp::{RateLimitConfig, SmtpServerTimeouts};
use postbox_store::StorageConfig;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "POSTBOX_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./postbox.toml", "/etc/postbox/postbox.toml"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub domain: DomainConfig,
    pub relay: RelayConfig,
    pub dkim: Option<DkimConfig>,
    pub storage: StorageConfig,
    pub mail: MailConfig,
    pub accounts: Vec<AccountConfig>,
    pub domains: Vec<DomainEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub require_auth: bool,
    pub max_connections: usize,
    /// Accepted messages per connection before `421`
    pub max_messages: usize,
    pub max_message_size: usize,
    /// Greeting host name, the authoritative domain when unset
    pub banner: Option<String>,
    pub command_timeout_secs: u64,
    pub data_timeout_secs: u64,
    /// Per-sender limit for unauthenticated sessions, off when absent
    pub unauthenticated_rate_limit: Option<RateLimitConfig>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2525,
            require_auth: true,
            max_connections: 100,
            max_messages: 10,
            max_message_size: 10 * 1024 * 1024,
            banner: None,
            command_timeout_secs: 300,
            data_timeout_secs: 180,
            unauthenticated_rate_limit: None,
        }
    }
}

impl SmtpConfig {
    #[must_use]
    pub fn timeouts(&self) -> SmtpServerTimeouts {
        SmtpServerTimeouts {
            command_secs: self.command_timeout_secs,
            data_secs: self.data_timeout_secs,
            ..SmtpServerTimeouts::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Mail for this domain is stored; everything else passes through
    pub authoritative: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            authoritative: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Larger attachments are recorded as failed uploads, 0 disables
    pub max_attachment_size: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            max_attachment_size: 10 * 1024 * 1024,
        }
    }
}

/// ```toml
/// [[accounts]]
/// address = "user@example.com"
/// password_hash = "$argon2id$v=19$..."
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub address: String,
    /// Output of `postbox hash-password`
    pub password_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainEntry {
    pub name: String,
}

impl Config {
    /// Find, read and parse the configuration, then apply the environment.
    ///
    /// Defaults are used when no file exists.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match find_config_file()? {
            Some(path) => Self::from_file(&path)?,
            None => {
                internal!(
                    level = WARN,
                    "No configuration file found, using defaults (tried ${CONFIG_ENV}, {})",
                    DEFAULT_PATHS.join(", ")
                );
                Self::default()
            }
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        internal!(level = INFO, "Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Host name used in the SMTP greeting and for EHLO to the relay
    #[must_use]
    pub fn banner(&self) -> String {
        self.smtp
            .banner
            .clone()
            .unwrap_or_else(|| self.domain.authoritative.clone())
    }

    /// Overlay environment variables read through `var`.
    ///
    /// # Errors
    /// A numeric variable that does not parse
    pub fn apply_env<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("SMTP_HOST") {
            self.smtp.host = host;
        }
        if let Some(port) = var("SMTP_PORT") {
            self.smtp.port = parse("SMTP_PORT", &port)?;
        }
        if let Some(require_auth) = var("SMTP_REQUIRE_AUTH") {
            self.smtp.require_auth = require_auth.trim() != "false";
        }
        if let Some(max) = var("SMTP_MAX_CONNECTIONS") {
            self.smtp.max_connections = parse("SMTP_MAX_CONNECTIONS", &max)?;
        }
        if let Some(max) = var("SMTP_MAX_MESSAGES") {
            self.smtp.max_messages = parse("SMTP_MAX_MESSAGES", &max)?;
        }
        if let Some(domain) = var("DEFAULT_DOMAIN") {
            self.domain.authoritative = domain;
        }
        if let Some(size) = var("MAX_ATTACHMENT_SIZE") {
            self.mail.max_attachment_size = parse("MAX_ATTACHMENT_SIZE", &size)?;
        }

        if let Some(host) = var("SMTP_RELAY_HOST") {
            self.relay.host = host;
        }
        if let Some(port) = var("SMTP_RELAY_PORT") {
            self.relay.port = parse("SMTP_RELAY_PORT", &port)?;
        }
        if let Some(secure) = var("SMTP_RELAY_SECURE") {
            self.relay.secure = secure.trim() == "true";
        }
        if let Some(user) = var("SMTP_RELAY_USER") {
            self.relay.username = Some(user);
        }
        if let Some(password) = var("SMTP_RELAY_PASS") {
            self.relay.password = Some(password);
        }
        if let Some(key) = var("SENDGRID_API_KEY") {
            self.relay.api_key = Some(key);
        }

        if let Some(private_key) = var("DKIM_PRIVATE_KEY") {
            let current = self.dkim.take();
            self.dkim = Some(DkimConfig {
                domain: var("DKIM_DOMAIN")
                    .or_else(|| current.as_ref().map(|dkim| dkim.domain.clone()))
                    .unwrap_or_else(|| self.domain.authoritative.clone()),
                selector: var("DKIM_SELECTOR")
                    .or_else(|| current.as_ref().map(|dkim| dkim.selector.clone()))
                    .unwrap_or_else(|| "default".to_string()),
                private_key: PathBuf::from(private_key),
            });
        } else if let Some(dkim) = self.dkim.as_mut() {
            if let Some(domain) = var("DKIM_DOMAIN") {
                dkim.domain = domain;
            }
            if let Some(selector) = var("DKIM_SELECTOR") {
                dkim.selector = selector;
            }
        }

        Ok(())
    }
}

fn parse<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {name}: {value:?}"))
}

/// Find the configuration file using the following precedence:
/// 1. `POSTBOX_CONFIG` environment variable
/// 2. ./postbox.toml (current working directory)
/// 3. /etc/postbox/postbox.toml (system-wide config)
pub fn find_config_file() -> anyhow::Result<Option<PathBuf>> {
    let defaults = DEFAULT_PATHS.map(PathBuf::from);
    locate(std::env::var(CONFIG_ENV).ok(), &defaults)
}

fn locate(from_env: Option<String>, defaults: &[PathBuf]) -> anyhow::Result<Option<PathBuf>> {
    if let Some(env_path) = from_env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    Ok(defaults.iter().find(|path| path.exists()).cloned())
}
