//! Mail service and outbound relay for postbox.
//!
//! [`MailService`] owns the create, receive and send paths over the stores in
//! `postbox-store`. Inbound SMTP reaches it through [`MailHandler`]; outbound
//! mail leaves through a [`RelayTransport`], normally an [`SmtpRelay`] to an
//! upstream provider with optional DKIM signing.

pub mod config;
pub mod dkim;
pub mod dns;
pub mod domain;
pub mod error;
pub mod handler;
pub mod outbound;
pub mod relay;
pub mod service;

pub use config::{DkimConfig, RelayConfig};
pub use dkim::{DkimError, DkimSigner};
pub use dns::{HickoryMxResolver, MxResolver, StaticMxResolver};
pub use domain::DomainService;
pub use error::{MailError, RelayError};
pub use handler::{MailHandler, MailHandlerFactory};
pub use outbound::{OutboundAttachment, OutboundMessage, OutboundMessageBuilder};
pub use relay::{RelayReceipt, RelayTransport, SmtpRelay};
pub use service::{DEFAULT_PAGE_SIZE, DraftMail, MailService};
