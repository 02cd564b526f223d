use postbox_common::{context, error::SessionError, incoming, internal, status::Status, tracing};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Context, Session};
use crate::{State, command::Command, error::ConnectionError, state};

/// Longest command line accepted, generous enough for AUTH PLAIN payloads
const MAX_COMMAND_LINE: usize = 4096;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Receive and process one line from the client.
    ///
    /// Returns `Ok(true)` if the client has closed the connection.
    ///
    /// # Errors
    /// Returns `SessionError` on an I/O failure.
    pub(super) async fn receive(
        &mut self,
        validate_context: &mut context::Context,
    ) -> Result<bool, SessionError> {
        let reading = matches!(self.context.state, State::Reading(_));
        let max = if !reading {
            MAX_COMMAND_LINE
        } else if self.max_message_size == 0 {
            usize::MAX
        } else {
            self.max_message_size
                .saturating_sub(self.context.message.len())
        };

        match self.connection.read_line(max).await {
            Ok(None) => Ok(true),
            Ok(Some(line)) if reading => {
                self.handle_data_reception(&line, validate_context);
                Ok(false)
            }
            Ok(Some(line)) => {
                self.handle_command_reception(&line, validate_context);
                Ok(false)
            }
            Err(ConnectionError::LineTooLong(_)) if reading => {
                self.refuse_oversized(validate_context);
                Ok(false)
            }
            Err(ConnectionError::LineTooLong(max)) => {
                let previous = std::mem::take(&mut self.context.state);
                self.context = Context {
                    state: State::Invalid(state::Invalid {
                        reason: format!("5.5.2 Line exceeds {max} bytes"),
                        status: Status::SyntaxError,
                        previous: Box::new(previous),
                    }),
                    message: Vec::new(),
                    sent: false,
                };
                Ok(false)
            }
            // Consider any other errors received here to be fatal
            Err(err) => {
                internal!("Error: {err}");
                Err(SessionError::Protocol(err.to_string()))
            }
        }
    }

    fn refuse_oversized(&mut self, validate_context: &mut context::Context) {
        validate_context.respond(
            Status::ExceededStorage,
            format!(
                "5.3.4 Message size exceeds maximum allowed size of {} bytes",
                self.max_message_size
            ),
        );
        validate_context.reset_transaction();
        self.context = Context {
            state: State::Close(state::Close),
            message: Vec::new(),
            sent: false,
        };
    }

    /// Handle one line of message content, undoing dot-stuffing
    /// (RFC 5321 Section 4.5.2).
    fn handle_data_reception(&mut self, line: &[u8], validate_context: &mut context::Context) {
        if line == b"." {
            let message = std::mem::take(&mut self.context.message);
            tracing::debug!("Received {} bytes of message content", message.len());

            validate_context.data = Some(message.into());
            self.context = Context {
                state: State::PostDot(state::PostDot),
                message: Vec::new(),
                sent: false,
            };
            return;
        }

        let content = line.strip_prefix(b".").unwrap_or(line);
        let total_size = self
            .context
            .message
            .len()
            .saturating_add(content.len())
            .saturating_add(2);

        if self.max_message_size > 0 && total_size > self.max_message_size {
            self.refuse_oversized(validate_context);
            return;
        }

        self.context.message.extend_from_slice(content);
        self.context.message.extend_from_slice(b"\r\n");
    }

    /// Handle reception of an SMTP command, or of an answer to an AUTH
    /// challenge.
    fn handle_command_reception(&mut self, line: &[u8], validate_context: &mut context::Context) {
        let command = if matches!(self.context.state, State::AuthChallenge(_)) {
            Command::AuthResponse(String::from_utf8_lossy(line).into_owned())
        } else {
            Command::try_from(line).unwrap_or_else(|e| e)
        };

        incoming!("{command}");

        let current = std::mem::take(&mut self.context.state);
        self.context = Context {
            state: current.transition(command, validate_context),
            message: Vec::new(),
            sent: false,
        };

        tracing::debug!("Transitioned to {:?}", self.context.state);
    }
}
