//! Outbound relay through an upstream SMTP provider.
//!
//! One call to [`RelayTransport::send`] is one bounded attempt. Nothing here
//! retries; a failed send leaves the message `failed` and the caller decides.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use postbox_common::internal;
use postbox_smtp::client::SmtpClient;
use tracing::warn;

use crate::{config::RelayConfig, dkim::DkimSigner, error::RelayError, outbound::OutboundMessage};

/// What the upstream said when it took the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReceipt {
    pub message_id: String,
    pub code: u16,
    pub response: String,
}

#[async_trait]
pub trait RelayTransport: Send + Sync + Debug {
    /// Hand `message` to the upstream. The envelope uses exactly
    /// [`OutboundMessage::from`] and [`OutboundMessage::to`].
    async fn send(&self, message: &OutboundMessage) -> Result<RelayReceipt, RelayError>;
}

#[derive(Debug, Clone)]
pub struct SmtpRelay {
    config: RelayConfig,
    dkim: Option<DkimSigner>,
    helo: String,
}

impl SmtpRelay {
    #[must_use]
    pub fn new(config: RelayConfig, helo: impl Into<String>) -> Self {
        Self {
            config,
            dkim: None,
            helo: helo.into(),
        }
    }

    #[must_use]
    pub fn with_dkim(mut self, signer: Option<DkimSigner>) -> Self {
        self.dkim = signer;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub const fn dkim(&self) -> Option<&DkimSigner> {
        self.dkim.as_ref()
    }

    /// Connect, EHLO and authenticate, then QUIT without sending anything.
    ///
    /// # Errors
    /// The same classification as [`RelayTransport::send`]
    pub async fn check(&self) -> Result<(), RelayError> {
        let credentials = self.config.credentials()?;

        self.bounded(async {
            let mut client = self.open(&credentials).await?;
            if let Err(err) = client.quit().await {
                warn!("QUIT after relay check failed: {err}");
            }
            Ok(())
        })
        .await
    }

    async fn bounded<T, F>(&self, attempt: F) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>> + Send,
    {
        let limit = Duration::from_secs(self.config.timeout_secs);
        tokio::time::timeout(limit, attempt).await.map_err(|_| {
            RelayError::Connection(format!(
                "relay {} did not complete within {limit:?}",
                self.config.address()
            ))
        })?
    }

    /// Connect, greet, negotiate TLS and authenticate.
    async fn open(&self, (username, password): &(String, String)) -> Result<SmtpClient, RelayError> {
        let address = self.config.address();

        if self.config.accept_invalid_certs {
            warn!(
                server = %address,
                "TLS certificate validation is disabled for the relay"
            );
        }

        let mut client = if self.config.secure {
            SmtpClient::connect_tls(
                &address,
                self.config.host.clone(),
                self.config.accept_invalid_certs,
            )
            .await
        } else {
            SmtpClient::connect(&address, self.config.host.clone())
                .await
                .map(|client| client.accept_invalid_certs(self.config.accept_invalid_certs))
        }
        .map_err(|e| RelayError::Connection(format!("Failed to connect to {address}: {e}")))?;

        client.read_greeting().await?.into_result()?;
        client.ehlo(&self.helo).await?.into_result()?;

        if !client.is_tls() && client.supports("STARTTLS") {
            client.starttls().await?.into_result()?;
            client.ehlo(&self.helo).await?.into_result()?;
            internal!("Relay connection to {address} upgraded with STARTTLS");
        }

        client
            .authenticate(username, password)
            .await
            .map_err(RelayError::from_auth)?;

        Ok(client)
    }

    async fn transmit(
        &self,
        credentials: &(String, String),
        message: &OutboundMessage,
        payload: &[u8],
    ) -> Result<RelayReceipt, RelayError> {
        let mut client = self.open(credentials).await?;

        client
            .mail_from(message.from(), Some(payload.len()))
            .await?
            .into_result()?;
        client.rcpt_to(message.to()).await?.into_result()?;
        client.data().await?.into_result()?;
        let accepted = client.send_data(payload).await?.into_result()?;

        if let Err(err) = client.quit().await {
            warn!("QUIT after relaying {} failed: {err}", message.message_id());
        }

        Ok(RelayReceipt {
            message_id: message.message_id().to_string(),
            code: accepted.code,
            response: accepted.message(),
        })
    }
}

#[async_trait]
impl RelayTransport for SmtpRelay {
    async fn send(&self, message: &OutboundMessage) -> Result<RelayReceipt, RelayError> {
        let credentials = self.config.credentials()?;

        let mut payload = message.to_bytes();
        if let Some(signer) = &self.dkim {
            payload = signer
                .sign(&payload)
                .map_err(|e| RelayError::Configuration(e.to_string()))?;
        }

        let receipt = self
            .bounded(self.transmit(&credentials, message, &payload))
            .await?;

        internal!(
            level = INFO,
            "Relayed {} from {} to {} via {}: {} {}",
            receipt.message_id,
            message.from(),
            message.to(),
            self.config.host,
            receipt.code,
            receipt.response
        );
        Ok(receipt)
    }
}
