use std::{net::SocketAddr, sync::Arc, sync::LazyLock};

use anyhow::Context as _;
use postbox_common::{
    Signal,
    address::Address,
    internal,
    model::{Account, AccountId},
    tracing,
};
use postbox_mail::{
    DkimSigner, DomainService, HickoryMxResolver, MailHandlerFactory, MailService, MxResolver,
    RelayTransport, SmtpRelay,
};
use postbox_smtp::{Listener, RateLimiter, SessionConfig};
use postbox_store::{
    AccountDirectory, MailboxDirectory, MemoryDirectory, MemoryDomainRegistry, StoreError,
};
use tokio::sync::broadcast;

use crate::config::Config;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Every component of a running server, wired together.
pub struct Postbox {
    listener: Listener,
    service: Arc<MailService>,
    domains: DomainService,
    directory: Arc<MemoryDirectory>,
}

impl Postbox {
    /// Wire up the server described by `config`, with the SMTP relay and
    /// system DNS resolver.
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let signer = match &config.dkim {
            Some(dkim) => Some(
                DkimSigner::from_config(dkim)
                    .await
                    .context("Failed to load DKIM key")?,
            ),
            None => None,
        };
        let relay = SmtpRelay::new(config.relay.clone(), config.banner()).with_dkim(signer);

        let resolver: Arc<dyn MxResolver> = match HickoryMxResolver::new() {
            Ok(resolver) => Arc::new(resolver),
            Err(err) => {
                internal!(
                    level = WARN,
                    "System resolver unavailable ({err}), using public resolvers"
                );
                Arc::new(HickoryMxResolver::with_defaults())
            }
        };

        Self::build_with(config, Arc::new(relay), resolver).await
    }

    /// [`Self::build`] with the relay and resolver supplied by the caller
    pub async fn build_with(
        config: &Config,
        relay: Arc<dyn RelayTransport>,
        resolver: Arc<dyn MxResolver>,
    ) -> anyhow::Result<Self> {
        let messages = config
            .storage
            .messages
            .build()
            .context("Failed to initialise the message store")?;
        let attachments = config
            .storage
            .attachments
            .build()
            .context("Failed to initialise the attachment store")?;

        let directory = Arc::new(MemoryDirectory::new());
        seed_accounts(&directory, config).await?;

        let domains = DomainService::new(Arc::new(MemoryDomainRegistry::new()), resolver);
        for entry in &config.domains {
            match domains.create_domain(&entry.name).await {
                Ok(_) => {}
                Err(postbox_mail::MailError::Store(StoreError::AlreadyExists(name))) => {
                    internal!(level = WARN, "Domain {name} is listed twice");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let service = Arc::new(
            MailService::new(
                &config.domain.authoritative,
                Arc::clone(&directory) as Arc<dyn MailboxDirectory>,
                messages,
                attachments,
                relay,
            )
            .with_max_attachment_size(config.mail.max_attachment_size),
        );

        let session = SessionConfig::builder()
            .with_banner(config.banner())
            .with_max_message_size(config.smtp.max_message_size)
            .with_timeouts(config.smtp.timeouts())
            .with_require_auth(config.smtp.require_auth)
            .with_max_messages(config.smtp.max_messages)
            .with_rate_limiter(
                config
                    .smtp
                    .unauthenticated_rate_limit
                    .map(|limit| Arc::new(RateLimiter::new(limit))),
            )
            .build();

        let address = resolve_bind_address(&config.smtp.host, config.smtp.port).await?;
        let listener = Listener::bind(
            address,
            config.smtp.max_connections,
            session,
            Arc::new(MailHandlerFactory::new(
                Arc::clone(&service),
                Arc::clone(&directory) as Arc<dyn AccountDirectory>,
            )),
        )
        .await?;

        if !config.smtp.require_auth {
            internal!(
                level = WARN,
                "SMTP AUTH is optional; unauthenticated clients may submit mail"
            );
        }

        Ok(Self {
            listener,
            service,
            domains,
            directory,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn service(&self) -> Arc<MailService> {
        Arc::clone(&self.service)
    }

    #[must_use]
    pub const fn domains(&self) -> &DomainService {
        &self.domains
    }

    #[must_use]
    pub fn directory(&self) -> Arc<MemoryDirectory> {
        Arc::clone(&self.directory)
    }

    /// Serve until `shutdown` delivers [`Signal::Shutdown`]
    pub async fn serve(self, shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        self.listener.serve(shutdown).await
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> anyhow::Result<()> {
        internal!("Controller running");

        let ret = tokio::select! {
            r = self.serve(SHUTDOWN_BROADCAST.subscribe()) => r,
            r = shutdown() => r,
        };

        internal!(level = INFO, "Shutting down...");
        ret
    }
}

async fn seed_accounts(directory: &MemoryDirectory, config: &Config) -> anyhow::Result<()> {
    for seed in &config.accounts {
        let address = Address::parse(&seed.address)
            .with_context(|| format!("Invalid account address {:?}", seed.address))?;

        let account = directory
            .insert_account(Account {
                id: AccountId::generate(),
                address: address.clone(),
                password_hash: seed.password_hash.clone(),
            })
            .await
            .with_context(|| format!("Unable to add account {address}"))?;

        directory
            .register(&address, account.id, Some(address.domain().to_string()))
            .await
            .with_context(|| format!("Unable to create mailbox for {address}"))?;

        if !address.is_in_domain(&config.domain.authoritative) {
            internal!(
                level = WARN,
                "Account {address} is outside {}; inbound mail for it will not be stored",
                config.domain.authoritative
            );
        }
    }

    internal!(level = INFO, "Loaded {} accounts", config.accounts.len());
    Ok(())
}

async fn resolve_bind_address(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Unable to resolve listen address {host}:{port}"))?
        .next()
        .with_context(|| format!("No address found for {host}:{port}"))
}

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}
