use std::{borrow::Cow, sync::Arc};

use ahash::AHashMap;

use crate::{envelope::Envelope, status::Status};

/// Per-connection business context shared between the SMTP state machine
/// and the transaction handler.
///
/// The state machine records what the client said; the handler validates it
/// and leaves the reply to send in [`Context::response`].
#[derive(Debug, Default, Clone)]
pub struct Context {
    /// Identity the client gave in HELO/EHLO
    pub id: String,
    /// `true` when the client greeted with EHLO
    pub extended: bool,
    /// Address of the account that authenticated on this connection
    pub authenticated: Option<String>,
    pub envelope: Envelope,
    /// Raw message bytes once DATA has been terminated, dot-unstuffed
    pub data: Option<Arc<[u8]>>,
    pub response: Option<(Status, Cow<'static, str>)>,
    pub banner: Arc<str>,
    pub max_message_size: usize,
    /// Number of DATA transactions accepted on this connection
    pub messages_accepted: usize,
    pub metadata: AHashMap<Cow<'static, str>, String>,
}

impl Context {
    /// The envelope sender as a string, empty for the null sender
    pub fn sender(&self) -> String {
        self.envelope
            .sender()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.envelope
            .recipients()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub const fn is_authenticated(&self) -> bool {
        self.authenticated.is_some()
    }

    /// Set the reply for the current command
    pub fn respond(&mut self, status: Status, message: impl Into<Cow<'static, str>>) {
        self.response = Some((status, message.into()));
    }

    /// Reset transaction state after DATA completes or on RSET
    pub fn reset_transaction(&mut self) {
        self.envelope.clear();
        self.data = None;
    }
}
