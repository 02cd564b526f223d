use postbox_common::{context, internal, status::Status, tracing};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{State, session::Session, state};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Run the transaction handler for the state just entered, and undo
    /// whatever the state machine recorded if it refuses.
    pub(super) async fn emit(&mut self, validate_context: &mut context::Context) {
        let valid = match &mut self.context.state {
            State::Connect(_) => self.handler.validate_connect(validate_context).await,
            State::Helo(_) | State::Ehlo(_) => self.handler.validate_ehlo(validate_context).await,
            State::Authenticate(auth) => {
                let username = std::mem::take(&mut auth.username);
                let password = std::mem::take(&mut auth.password);
                self.context.state = State::ready(validate_context);
                self.authenticate(validate_context, &username, &password)
                    .await
            }
            State::MailFrom(_) => {
                self.admit(validate_context)
                    && self.handler.validate_mail_from(validate_context).await
            }
            State::RcptTo(_) => self.handler.validate_rcpt_to(validate_context).await,
            State::PostDot(_) if validate_context.data.is_some() => {
                self.handle_message(validate_context).await
            }
            _ => return,
        };

        if valid {
            return;
        }

        match &self.context.state {
            State::Connect(_) | State::Ehlo(_) | State::Helo(_) => {
                self.context.state = State::Reject(state::Reject);
            }
            State::MailFrom(_) => {
                validate_context.reset_transaction();
                self.context.state = State::ready(validate_context);
            }
            State::RcptTo(state::RcptTo { sender }) => {
                let sender = sender.clone();
                validate_context.envelope.pop_recipient();

                self.context.state = if validate_context.envelope.recipients().is_empty() {
                    State::MailFrom(state::MailFrom { sender })
                } else {
                    State::RcptTo(state::RcptTo { sender })
                };
            }
            _ => {}
        }
    }

    async fn authenticate(
        &mut self,
        validate_context: &mut context::Context,
        username: &str,
        password: &str,
    ) -> bool {
        let valid = self
            .handler
            .authenticate(validate_context, username, password)
            .await;

        if valid {
            internal!(level = INFO, "Authenticated as {username}");
            if validate_context.response.is_none() {
                validate_context.respond(Status::AuthSuccess, "2.7.0 Authentication successful");
            }
        } else {
            tracing::warn!(username, "Authentication failed");
            validate_context.respond(
                Status::AuthInvalid,
                "5.7.8 Authentication credentials invalid",
            );
        }

        valid
    }

    /// Session-level rules checked before the handler sees MAIL FROM.
    fn admit(&mut self, validate_context: &mut context::Context) -> bool {
        if self.policy.require_auth && !validate_context.is_authenticated() {
            validate_context.respond(Status::AuthRequired, "5.7.0 Authentication required");
            return false;
        }

        if self.policy.max_messages > 0
            && validate_context.messages_accepted >= self.policy.max_messages
        {
            validate_context.respond(
                Status::Unavailable,
                "4.7.0 Too many messages, please reconnect",
            );
            self.context.state = State::Close(state::Close);
            return false;
        }

        if !validate_context.is_authenticated()
            && let Some(limiter) = &self.policy.rate_limiter
            && !limiter.check(&validate_context.sender())
        {
            tracing::warn!(sender = %validate_context.sender(), "Rate limit exceeded");
            validate_context.respond(Status::MailboxBusy, "4.7.1 Rate limit exceeded");
            return false;
        }

        true
    }

    async fn handle_message(&mut self, validate_context: &mut context::Context) -> bool {
        let accepted = self.handler.handle_message(validate_context).await;

        if accepted {
            validate_context.messages_accepted += 1;
        }

        if validate_context.response.is_none() {
            if accepted {
                validate_context.respond(Status::Ok, "2.0.0 Ok: queued");
            } else {
                validate_context.respond(Status::TransactionFailed, "5.6.0 Transaction failed");
            }
        }

        validate_context.reset_transaction();
        accepted
    }
}
