//! SMTP stage callbacks backed by the account directory and the mail service.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use postbox_common::{context::Context, internal, mime, status::Status};
use postbox_smtp::{SmtpTransactionHandler, TransactionHandlerFactory};
use postbox_store::AccountDirectory;
use tracing::{error, warn};

use crate::{error::MailError, service::MailService};

/// One per connection. Holds no state of its own between callbacks.
#[derive(Debug, Clone)]
pub struct MailHandler {
    service: Arc<MailService>,
    accounts: Arc<dyn AccountDirectory>,
    peer: Option<SocketAddr>,
}

impl MailHandler {
    #[must_use]
    pub fn new(service: Arc<MailService>, accounts: Arc<dyn AccountDirectory>) -> Self {
        Self {
            service,
            accounts,
            peer: None,
        }
    }

    async fn deliver(&self, ctx: &mut Context, decoded: mime::DecodedMessage) -> bool {
        match self.service.receive_mail(decoded).await {
            Ok(message) => {
                ctx.respond(Status::Ok, format!("2.0.0 Ok: queued as {}", message.id));
                true
            }
            Err(MailError::MailboxNotFound(address)) => {
                ctx.respond(Status::Error, "5.1.1 Mailbox does not exist");
                warn!("Delivery to {address} refused, no mailbox");
                false
            }
            Err(err) if err.is_transient() => {
                error!("Delivery failed, sender may retry: {err}");
                ctx.respond(
                    Status::ActionUnavailable,
                    "4.3.0 Temporary storage failure, try again later",
                );
                false
            }
            Err(err) => {
                error!("Delivery failed: {err}");
                ctx.respond(Status::TransactionFailed, "5.3.0 Message could not be stored");
                false
            }
        }
    }
}

#[async_trait]
impl SmtpTransactionHandler for MailHandler {
    async fn validate_connect(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn validate_ehlo(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn authenticate(&mut self, ctx: &mut Context, username: &str, password: &str) -> bool {
        match self.accounts.authenticate(username, password).await {
            Ok(Some(account)) => {
                ctx.authenticated = Some(account.address.to_string());
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!(peer = ?self.peer, "Account lookup failed during AUTH: {err}");
                false
            }
        }
    }

    async fn validate_mail_from(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn validate_rcpt_to(&mut self, ctx: &mut Context) -> bool {
        let Some(recipient) = ctx.envelope.recipients().last().cloned() else {
            return false;
        };

        if !recipient.is_in_domain(self.service.authoritative_domain()) {
            internal!("Accepting external recipient {recipient} for pass-through");
            return true;
        }

        match self.service.find_mailbox(recipient.as_str()).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                ctx.respond(Status::Error, "5.1.1 Mailbox does not exist");
                false
            }
            Err(err) => {
                error!("Mailbox lookup for {recipient} failed: {err}");
                ctx.respond(
                    Status::ActionUnavailable,
                    "4.3.0 Mailbox lookup failed, try again later",
                );
                false
            }
        }
    }

    async fn handle_message(&mut self, ctx: &mut Context) -> bool {
        let Some(data) = ctx.data.clone() else {
            return false;
        };

        let decoded = match mime::decode(&data, &ctx.envelope) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Rejecting message from {}: {err}", ctx.sender());
                ctx.respond(Status::TransactionFailed, "5.6.0 Message could not be parsed");
                return false;
            }
        };

        let Some(recipient) = decoded.primary_recipient().map(str::to_string) else {
            ctx.respond(Status::TransactionFailed, "5.6.0 Message has no recipient");
            return false;
        };

        if self.service.is_local(&recipient) {
            return self.deliver(ctx, decoded).await;
        }

        if let Some(local) = ctx
            .envelope
            .recipients()
            .iter()
            .find(|address| self.service.is_local(address.as_str()))
        {
            warn!(
                "Message from {} is addressed to {recipient} in its headers, not storing it for envelope recipient {local}",
                decoded.from
            );
        }

        internal!(
            level = INFO,
            "Passing through message from {} to {} ({} bytes, not stored)",
            decoded.from,
            recipient,
            data.len()
        );
        ctx.respond(Status::Ok, "2.0.0 Ok: accepted");
        true
    }
}

/// Hands every connection a [`MailHandler`] sharing the same service.
#[derive(Debug, Clone)]
pub struct MailHandlerFactory {
    service: Arc<MailService>,
    accounts: Arc<dyn AccountDirectory>,
}

impl MailHandlerFactory {
    #[must_use]
    pub fn new(service: Arc<MailService>, accounts: Arc<dyn AccountDirectory>) -> Self {
        Self { service, accounts }
    }
}

impl TransactionHandlerFactory for MailHandlerFactory {
    fn create(&self, peer: SocketAddr) -> Box<dyn SmtpTransactionHandler> {
        Box::new(MailHandler {
            peer: Some(peer),
            ..MailHandler::new(Arc::clone(&self.service), Arc::clone(&self.accounts))
        })
    }
}
