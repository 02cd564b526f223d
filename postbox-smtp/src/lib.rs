//! SMTP for postbox: the inbound listener with its session state machine,
//! and the client the relay uses to talk to an upstream provider.
//!
//! The listener is plaintext only. `STARTTLS` is refused with `502`, so it
//! belongs behind a trusted network boundary or a TLS-terminating proxy.

pub mod client;
pub mod command;
mod connection;
pub mod error;
pub mod listener;
pub mod rate_limit;
pub mod session;
pub mod state;
pub mod transaction_handler;

pub use command::{Command, MailParameters};
pub use listener::Listener;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use session::{Session, SessionConfig, SessionPolicy, SmtpServerTimeouts};
pub use state::State;
pub use transaction_handler::{AcceptAllHandler, SmtpTransactionHandler, TransactionHandlerFactory};
