use postbox_common::{context, status::Status};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State,
    session::{Event, Response, Session},
    state,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// The reply for the current state.
    ///
    /// All validation and work happens in `emit()`; a reply it leaves in the
    /// context takes precedence over the state's default.
    pub(super) async fn response(&mut self, validate_context: &mut context::Context) -> Response {
        if self.context.sent {
            return (None, Event::ConnectionKeepAlive);
        }

        self.emit(validate_context).await;

        if let Some((status, ref message)) = validate_context.response {
            let event = if self.context.state.should_close() || status == Status::Unavailable {
                Event::ConnectionClose
            } else {
                Event::ConnectionKeepAlive
            };

            return (Some(vec![format!("{status} {message}")]), event);
        }

        self.default_response(validate_context)
    }

    fn default_response(&mut self, validate_context: &context::Context) -> Response {
        let keep_alive = |line: String| (Some(vec![line]), Event::ConnectionKeepAlive);

        match &self.context.state {
            State::Connect(_) => keep_alive(format!(
                "{} {} ESMTP Service ready",
                Status::ServiceReady,
                self.banner
            )),
            State::Ehlo(state::Ehlo { id }) => (
                Some(vec![
                    format!("{}-{} greets {id}", Status::Ok, self.banner),
                    format!("{}-AUTH PLAIN LOGIN", Status::Ok),
                    format!("{}-SIZE {}", Status::Ok, self.max_message_size),
                    format!("{}-8BITMIME", Status::Ok),
                    format!("{} HELP", Status::Ok),
                ]),
                Event::ConnectionKeepAlive,
            ),
            State::Helo(state::Helo { id }) => {
                keep_alive(format!("{} {} says hello to {id}", Status::Ok, self.banner))
            }
            State::Help(_) => keep_alive(format!(
                "{} 2.0.0 Commands: HELO EHLO AUTH MAIL RCPT DATA RSET NOOP HELP QUIT",
                Status::HelpMessage
            )),
            State::Noop(_) | State::Rset(_) => keep_alive(format!("{} 2.0.0 Ok", Status::Ok)),
            State::AuthChallenge(challenge) => {
                keep_alive(format!("{} {}", Status::AuthContinue, challenge.prompt()))
            }
            State::MailFrom(_) => keep_alive(format!("{} 2.1.0 Ok", Status::Ok)),
            State::RcptTo(_) => keep_alive(format!("{} 2.1.5 Ok", Status::Ok)),
            State::Data(_) => self.data_response(validate_context),
            State::Quit(_) => (
                Some(vec![format!(
                    "{} 2.0.0 {} closing connection",
                    Status::GoodBye,
                    self.banner
                )]),
                Event::ConnectionClose,
            ),
            State::Invalid(state::Invalid { reason, status, .. }) => {
                keep_alive(format!("{status} {reason}"))
            }
            State::Reject(_) | State::Close(_) => (
                Some(vec![format!("{} 4.3.0 Unavailable", Status::Unavailable)]),
                Event::ConnectionClose,
            ),
            // Reading produces no reply; Authenticate and PostDot always
            // leave one in the context.
            State::Reading(_) | State::PostDot(_) | State::Authenticate(_) => {
                (None, Event::ConnectionKeepAlive)
            }
        }
    }

    /// Reply to DATA and start reading message content
    fn data_response(&mut self, validate_context: &context::Context) -> Response {
        self.context.state = State::Reading(state::Reading);
        self.context.message.clear();
        self.context
            .message
            .reserve(validate_context.max_message_size.min(64 * 1024));

        (
            Some(vec![format!(
                "{} End data with <CR><LF>.<CR><LF>",
                Status::StartMailInput
            )]),
            Event::ConnectionKeepAlive,
        )
    }
}
