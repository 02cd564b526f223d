//! Business callbacks for SMTP sessions.
//!
//! The state machine decides what the client is allowed to say next; the
//! [`SmtpTransactionHandler`] decides whether what it said is acceptable
//! and does the work once a message is complete.

use std::net::SocketAddr;

use async_trait::async_trait;
use postbox_common::{context::Context, status::Status};

/// Stage callbacks invoked after each state transition.
///
/// Every callback returns `true` to accept and `false` to reject. A rejection
/// should leave a reply in [`Context::response`]; the session supplies a
/// generic one otherwise. Callbacks must not panic or surface errors: every
/// failure is expressed as a reply.
#[async_trait]
pub trait SmtpTransactionHandler: Send + Sync {
    /// Called when a client connects, before the greeting is sent
    async fn validate_connect(&mut self, ctx: &mut Context) -> bool;

    /// Called after EHLO or HELO
    async fn validate_ehlo(&mut self, ctx: &mut Context) -> bool;

    /// Verify credentials supplied through AUTH.
    ///
    /// On success the implementation sets [`Context::authenticated`]. The
    /// rejection reply must not reveal whether the user exists.
    async fn authenticate(&mut self, ctx: &mut Context, username: &str, password: &str) -> bool;

    /// Called after MAIL FROM, once the address shape has been checked
    async fn validate_mail_from(&mut self, ctx: &mut Context) -> bool;

    /// Called after each RCPT TO; the recipient being validated is the last
    /// one in the envelope.
    async fn validate_rcpt_to(&mut self, ctx: &mut Context) -> bool;

    /// Process a complete message held in [`Context::data`]
    async fn handle_message(&mut self, ctx: &mut Context) -> bool;
}

/// Creates one handler per accepted connection.
pub trait TransactionHandlerFactory: Send + Sync {
    fn create(&self, peer: SocketAddr) -> Box<dyn SmtpTransactionHandler>;
}

/// Accepts everything and discards messages. Useful for exercising the
/// protocol layer on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllHandler;

#[async_trait]
impl SmtpTransactionHandler for AcceptAllHandler {
    async fn validate_connect(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn validate_ehlo(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn authenticate(&mut self, ctx: &mut Context, username: &str, _password: &str) -> bool {
        ctx.authenticated = Some(username.to_string());
        ctx.respond(Status::AuthSuccess, "2.7.0 Authentication successful");
        true
    }

    async fn validate_mail_from(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn validate_rcpt_to(&mut self, _ctx: &mut Context) -> bool {
        true
    }

    async fn handle_message(&mut self, ctx: &mut Context) -> bool {
        ctx.respond(Status::Ok, "2.0.0 Ok: discarded");
        true
    }
}

impl TransactionHandlerFactory for AcceptAllHandler {
    fn create(&self, _peer: SocketAddr) -> Box<dyn SmtpTransactionHandler> {
        Box::new(Self)
    }
}
