//! A complete server on an ephemeral port, backed by memory stores and a
//! mock upstream relay.
//!
//! ```no_run
//! let harness = E2ETestHarness::builder()
//!     .with_account("user@x.me", "secret")
//!     .build()
//!     .await?;
//!
//! let mut client = harness.client().await?;
//! harness.login(&mut client, "user@x.me", "secret").await?;
//! harness.shutdown().await;
//! ```

use std::{net::SocketAddr, sync::Arc, time::Duration};

use postbox::{
    config::{AccountConfig, Config},
    controller::Postbox,
};
use postbox_common::{Signal, model::Message};
use postbox_mail::{MailService, RelayConfig, SmtpRelay, StaticMxResolver};
use postbox_smtp::client::{Response, SmtpClient};
use postbox_store::{
    AttachmentStorageConfig, MemoryConfig, MessageStorageConfig, StorageConfig, credentials,
};
use tokio::{sync::broadcast, task::JoinHandle, time::timeout};

use super::mock_server::{MockRelay, SmtpCommand};

pub struct E2ETestHarness {
    smtp_addr: SocketAddr,
    relay: MockRelay,
    service: Arc<MailService>,
    handle: JoinHandle<anyhow::Result<()>>,
    shutdown_tx: broadcast::Sender<Signal>,
}

impl E2ETestHarness {
    #[must_use]
    pub fn builder() -> E2ETestHarnessBuilder {
        E2ETestHarnessBuilder {
            domain: "x.me".to_string(),
            accounts: Vec::new(),
            require_auth: true,
            max_messages: 10,
        }
    }

    #[must_use]
    pub const fn smtp_addr(&self) -> SocketAddr {
        self.smtp_addr
    }

    #[must_use]
    pub fn service(&self) -> Arc<MailService> {
        Arc::clone(&self.service)
    }

    pub async fn relay_commands(&self) -> Vec<SmtpCommand> {
        self.relay.commands().await
    }

    pub async fn relayed_messages(&self) -> Vec<Vec<u8>> {
        self.relay.messages().await
    }

    /// A client that has read the greeting and sent EHLO
    pub async fn client(&self) -> anyhow::Result<SmtpClient> {
        let mut client =
            SmtpClient::connect(&self.smtp_addr.to_string(), "localhost".to_string()).await?;
        client.read_greeting().await?.into_result()?;
        client.ehlo("test-client").await?.into_result()?;
        Ok(client)
    }

    #[allow(clippy::unused_self)]
    pub async fn login(
        &self,
        client: &mut SmtpClient,
        username: &str,
        password: &str,
    ) -> anyhow::Result<()> {
        client.authenticate(username, password).await?;
        Ok(())
    }

    /// Run one MAIL/RCPT/DATA transaction and return the final reply,
    /// or the first reply that refused the transaction.
    pub async fn transaction(
        client: &mut SmtpClient,
        from: &str,
        to: &str,
        content: &str,
    ) -> anyhow::Result<Response> {
        let reply = client.mail_from(from, None).await?;
        if !reply.is_success() {
            return Ok(reply);
        }
        let reply = client.rcpt_to(to).await?;
        if !reply.is_success() {
            return Ok(reply);
        }
        let reply = client.data().await?;
        if reply.code != 354 {
            return Ok(reply);
        }
        Ok(client.send_data(content.as_bytes()).await?)
    }

    /// Messages stored in `address`'s mailbox, newest first
    pub async fn mailbox(&self, address: &str) -> anyhow::Result<Vec<Message>> {
        let mailbox = self
            .service
            .find_mailbox(address)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no mailbox for {address}"))?;
        Ok(self
            .service
            .list_mails(mailbox.id, postbox_mail::DEFAULT_PAGE_SIZE, 0)
            .await?)
    }

    /// Stop the server and the mock relay, waiting up to five seconds for
    /// the listener to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(Signal::Shutdown);
        self.relay.shutdown();

        timeout(Duration::from_secs(5), self.handle).await???;
        Ok(())
    }
}

pub struct E2ETestHarnessBuilder {
    domain: String,
    accounts: Vec<(String, String)>,
    require_auth: bool,
    max_messages: usize,
}

impl E2ETestHarnessBuilder {
    #[must_use]
    #[allow(dead_code)]
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    /// Seed an account and its mailbox
    #[must_use]
    pub fn with_account(mut self, address: &str, password: &str) -> Self {
        self.accounts
            .push((address.to_string(), password.to_string()));
        self
    }

    #[must_use]
    pub const fn require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    #[must_use]
    pub const fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub async fn build(self) -> anyhow::Result<E2ETestHarness> {
        let relay = MockRelay::builder().build().await?;

        let mut config = Config::default();
        config.smtp.host = "127.0.0.1".to_string();
        config.smtp.port = 0;
        config.smtp.require_auth = self.require_auth;
        config.smtp.max_messages = self.max_messages;
        config.domain.authoritative.clone_from(&self.domain);
        config.storage = StorageConfig {
            messages: MessageStorageConfig::Memory(MemoryConfig::default()),
            attachments: AttachmentStorageConfig::Memory,
        };
        config.relay = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: relay.addr().port(),
            username: Some("relay-user".to_string()),
            password: Some("relay-pass".to_string()),
            timeout_secs: 5,
            ..RelayConfig::default()
        };
        for (address, password) in &self.accounts {
            config.accounts.push(AccountConfig {
                address: address.clone(),
                password_hash: credentials::hash_password(password)?,
            });
        }

        let transport = SmtpRelay::new(config.relay.clone(), self.domain.clone());
        let postbox = Postbox::build_with(
            &config,
            Arc::new(transport),
            Arc::new(StaticMxResolver::new()),
        )
        .await?;

        let smtp_addr = postbox.local_addr()?;
        let service = postbox.service();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(8);
        let handle = tokio::spawn(postbox.serve(shutdown_rx));

        Ok(E2ETestHarness {
            smtp_addr,
            relay,
            service,
            handle,
            shutdown_tx,
        })
    }
}
