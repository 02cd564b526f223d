use core::fmt::{self, Debug, Display, Formatter};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use postbox_common::{address::Address, context::Context, status::Status};

use crate::command::{AuthMechanism, Command, HeloVariant};

/// Base64 of `Username:`
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// Base64 of `Password:`
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Client just connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect;

/// After EHLO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ehlo {
    pub id: String,
}

/// After HELO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helo {
    pub id: String,
}

/// HELP, resuming `previous` afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Help {
    pub previous: Box<State>,
}

/// NOOP, resuming `previous` afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Noop {
    pub previous: Box<State>,
}

/// RSET: the transaction has been discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rset {
    pub previous: Box<State>,
}

/// Waiting for the client to answer a `334` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub mechanism: AuthMechanism,
    /// LOGIN only: the username, once it has been given
    pub username: Option<String>,
}

impl AuthChallenge {
    /// Text following `334 ` in the challenge line
    #[must_use]
    pub const fn prompt(&self) -> &'static str {
        match (&self.mechanism, &self.username) {
            (AuthMechanism::Login, None) => LOGIN_USERNAME_PROMPT,
            (AuthMechanism::Login, Some(_)) => LOGIN_PASSWORD_PROMPT,
            _ => "",
        }
    }
}

/// Credentials are complete and waiting for verification
#[derive(Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub username: String,
    pub password: String,
}

impl Debug for Authenticate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticate")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// After MAIL FROM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailFrom {
    pub sender: Option<Address>,
}

/// After at least one RCPT TO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcptTo {
    pub sender: Option<Address>,
}

/// DATA accepted, about to send `354`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data;

/// Reading message content until `<CRLF>.<CRLF>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading;

/// Message content complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostDot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quit;

/// A command that was refused without ending the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalid {
    pub reason: String,
    pub status: Status,
    pub previous: Box<State>,
}

/// Rejected by the transaction handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Connect(Connect),
    Ehlo(Ehlo),
    Helo(Helo),
    Help(Help),
    Noop(Noop),
    Rset(Rset),
    AuthChallenge(AuthChallenge),
    Authenticate(Authenticate),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Data(Data),
    Reading(Reading),
    PostDot(PostDot),
    Quit(Quit),
    Invalid(Invalid),
    Reject(Reject),
    Close(Close),
}

impl Default for State {
    fn default() -> Self {
        Self::Connect(Connect)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Reading(_) | Self::PostDot(_) => "",
            Self::Connect(_) => "Connect",
            Self::Close(_) => "Close",
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::Help(_) => "HELP",
            Self::Noop(_) => "NOOP",
            Self::Rset(_) => "RSET",
            Self::AuthChallenge(_) | Self::Authenticate(_) => "AUTH",
            Self::MailFrom(_) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Data(_) => "DATA",
            Self::Quit(_) => "QUIT",
            Self::Invalid(_) => "INVALID",
            Self::Reject(_) => "Rejected",
        })
    }
}

fn invalid(state: State, status: Status, reason: impl Into<String>) -> State {
    State::Invalid(Invalid {
        reason: reason.into(),
        status,
        previous: Box::new(state),
    })
}

fn decode_base64(value: &str) -> Option<String> {
    STANDARD
        .decode(value.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Split a decoded PLAIN response (`authzid\0authcid\0passwd`).
fn decode_plain(value: &str) -> Option<(String, String)> {
    let decoded = decode_base64(value)?;
    let mut fields = decoded.split('\0');
    let (_authzid, username, password) = (fields.next()?, fields.next()?, fields.next()?);

    if fields.next().is_some() || username.is_empty() {
        return None;
    }

    Some((username.to_string(), password.to_string()))
}

const CANNOT_DECODE: &str = "5.5.2 Cannot decode response";
const CANCELLED: &str = "5.0.0 Authentication cancelled";

impl State {
    /// The state a greeted session rests in between transactions.
    #[must_use]
    pub fn ready(ctx: &Context) -> Self {
        if ctx.extended {
            Self::Ehlo(Ehlo { id: ctx.id.clone() })
        } else {
            Self::Helo(Helo { id: ctx.id.clone() })
        }
    }

    /// States that only produce a reply hand control back to whatever came
    /// before them.
    fn resume(self) -> Self {
        match self {
            Self::Help(Help { previous })
            | Self::Noop(Noop { previous })
            | Self::Rset(Rset { previous })
            | Self::Invalid(Invalid { previous, .. }) => *previous,
            state => state,
        }
    }

    const fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Ehlo(_) | Self::Helo(_) | Self::PostDot(_)
        )
    }

    /// Transition from the current state on receipt of `command`.
    ///
    /// Address shapes and the declared SIZE are checked here; everything
    /// that needs a directory lookup happens in the transaction handler once
    /// the new state has been entered.
    #[must_use]
    pub fn transition(self, command: Command, ctx: &mut Context) -> Self {
        let state = self.resume();

        match (state, command) {
            (_, Command::Quit) => Self::Quit(Quit),

            (state, Command::Invalid(_)) => {
                invalid(state, Status::SyntaxError, "5.5.2 Command not recognized")
            }
            (state, Command::Malformed(reason)) => {
                invalid(state, Status::ParameterError, format!("5.5.4 {reason}"))
            }

            (_, Command::Helo(variant)) => {
                ctx.reset_transaction();
                match variant {
                    HeloVariant::Ehlo(id) => {
                        ctx.id.clone_from(&id);
                        ctx.extended = true;
                        Self::Ehlo(Ehlo { id })
                    }
                    HeloVariant::Helo(id) => {
                        ctx.id.clone_from(&id);
                        ctx.extended = false;
                        Self::Helo(Helo { id })
                    }
                }
            }

            (state, Command::StartTLS) => {
                invalid(state, Status::NotImplemented, "5.5.1 STARTTLS not supported")
            }

            (state, Command::Help) => Self::Help(Help {
                previous: Box::new(state),
            }),
            (state, Command::Noop) => Self::Noop(Noop {
                previous: Box::new(state),
            }),

            (Self::Connect(_), Command::Rset) => Self::Rset(Rset {
                previous: Box::new(Self::Connect(Connect)),
            }),
            (_, Command::Rset) => {
                ctx.reset_transaction();
                Self::Rset(Rset {
                    previous: Box::new(Self::ready(ctx)),
                })
            }

            (state, Command::Auth(mechanism, initial)) => Self::auth(state, mechanism, initial, ctx),
            (Self::AuthChallenge(challenge), Command::AuthResponse(line)) => {
                Self::auth_response(challenge, &line, ctx)
            }

            (state, Command::MailFrom(sender, params)) if state.is_ready() => {
                let sender = match sender.as_deref().map(Address::parse).transpose() {
                    Ok(sender) => sender,
                    Err(err) => {
                        return invalid(state, Status::ParameterError, format!("5.1.7 {err}"));
                    }
                };

                if ctx.max_message_size > 0
                    && let Some(size) = params.size()
                    && size > ctx.max_message_size
                {
                    return invalid(
                        state,
                        Status::ExceededStorage,
                        format!(
                            "5.3.4 Declared message size {size} exceeds maximum of {} bytes",
                            ctx.max_message_size
                        ),
                    );
                }

                ctx.reset_transaction();
                ctx.envelope.sender_mut().clone_from(&sender);
                Self::MailFrom(MailFrom { sender })
            }
            (state @ (Self::MailFrom(_) | Self::RcptTo(_)), Command::MailFrom(..)) => {
                invalid(state, Status::InvalidCommandSequence, "5.5.1 Sender already specified")
            }

            (
                Self::MailFrom(MailFrom { sender }) | Self::RcptTo(RcptTo { sender }),
                Command::RcptTo(raw),
            ) => match Address::parse(&raw) {
                Err(err) => invalid(
                    Self::transaction(sender, ctx),
                    Status::ParameterError,
                    format!("5.1.3 {err}"),
                ),
                Ok(recipient) if ctx.envelope.recipients().contains(&recipient) => {
                    ctx.respond(Status::Ok, "2.1.5 Recipient already accepted");
                    Self::Noop(Noop {
                        previous: Box::new(Self::transaction(sender, ctx)),
                    })
                }
                Ok(recipient) => {
                    ctx.envelope.add_recipient(recipient);
                    Self::RcptTo(RcptTo { sender })
                }
            },

            (Self::RcptTo(_), Command::Data) => Self::Data(Data),
            (state @ Self::MailFrom(_), Command::Data) => {
                invalid(state, Status::InvalidCommandSequence, "5.5.1 Need RCPT command")
            }

            (state @ Self::Connect(_), _) => invalid(
                state,
                Status::InvalidCommandSequence,
                "5.5.1 Send EHLO/HELO first",
            ),
            (state, Command::RcptTo(_) | Command::Data) if state.is_ready() => invalid(
                state,
                Status::InvalidCommandSequence,
                "5.5.1 Need MAIL command",
            ),
            (state, _) => invalid(
                state,
                Status::InvalidCommandSequence,
                "5.5.1 Bad sequence of commands",
            ),
        }
    }

    /// MAIL FROM until the first recipient is accepted, RCPT TO after.
    fn transaction(sender: Option<Address>, ctx: &Context) -> Self {
        if ctx.envelope.recipients().is_empty() {
            Self::MailFrom(MailFrom { sender })
        } else {
            Self::RcptTo(RcptTo { sender })
        }
    }

    fn auth(
        state: Self,
        mechanism: AuthMechanism,
        initial: Option<String>,
        ctx: &Context,
    ) -> Self {
        if matches!(state, Self::Connect(_)) {
            return invalid(
                state,
                Status::InvalidCommandSequence,
                "5.5.1 Send EHLO/HELO first",
            );
        }

        if ctx.is_authenticated() {
            return invalid(
                state,
                Status::InvalidCommandSequence,
                "5.5.1 Already authenticated",
            );
        }

        if !state.is_ready() {
            return invalid(
                state,
                Status::InvalidCommandSequence,
                "5.5.1 AUTH not permitted during a mail transaction",
            );
        }

        match (mechanism, initial) {
            (AuthMechanism::Other(_), _) => invalid(
                state,
                Status::ParameterNotImplemented,
                "5.5.4 Unrecognized authentication type",
            ),
            (_, Some(initial)) if initial.trim() == "*" => {
                invalid(state, Status::ParameterError, CANCELLED)
            }
            (AuthMechanism::Plain, Some(initial)) => match decode_plain(&initial) {
                Some((username, password)) => {
                    Self::Authenticate(Authenticate { username, password })
                }
                None => invalid(state, Status::ParameterError, CANNOT_DECODE),
            },
            (AuthMechanism::Login, Some(initial)) => match decode_base64(&initial) {
                Some(username) => Self::AuthChallenge(AuthChallenge {
                    mechanism: AuthMechanism::Login,
                    username: Some(username),
                }),
                None => invalid(state, Status::ParameterError, CANNOT_DECODE),
            },
            (mechanism, None) => Self::AuthChallenge(AuthChallenge {
                mechanism,
                username: None,
            }),
        }
    }

    fn auth_response(challenge: AuthChallenge, line: &str, ctx: &Context) -> Self {
        let ready = Self::ready(ctx);

        if line.trim() == "*" {
            return invalid(ready, Status::ParameterError, CANCELLED);
        }

        match challenge {
            AuthChallenge {
                mechanism: AuthMechanism::Login,
                username: None,
            } => decode_base64(line).map_or_else(
                || invalid(ready, Status::ParameterError, CANNOT_DECODE),
                |username| {
                    Self::AuthChallenge(AuthChallenge {
                        mechanism: AuthMechanism::Login,
                        username: Some(username),
                    })
                },
            ),
            AuthChallenge {
                mechanism: AuthMechanism::Login,
                username: Some(username),
            } => decode_base64(line).map_or_else(
                || invalid(ready, Status::ParameterError, CANNOT_DECODE),
                |password| Self::Authenticate(Authenticate { username, password }),
            ),
            AuthChallenge { .. } => decode_plain(line).map_or_else(
                || invalid(ready, Status::ParameterError, CANNOT_DECODE),
                |(username, password)| Self::Authenticate(Authenticate { username, password }),
            ),
        }
    }

    /// Check if this state should close the connection
    #[must_use]
    pub const fn should_close(&self) -> bool {
        matches!(self, Self::Quit(_) | Self::Close(_) | Self::Reject(_))
    }

    /// Between MAIL FROM and the end of DATA
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(
            self,
            Self::MailFrom(_) | Self::RcptTo(_) | Self::Data(_) | Self::Reading(_)
        )
    }
}
