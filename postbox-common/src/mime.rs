//! Decoding of raw RFC 5322 messages into the parts the mail service stores.
//!
//! Attachment content always leaves here as owned bytes, whatever transfer
//! encoding it arrived in.

use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use thiserror::Error;

use crate::{address, envelope::Envelope, model::NO_SUBJECT};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),

    #[error("Message has no recipient address")]
    NoRecipient,

    #[error("Message has no sender address")]
    NoSender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub message_id: Option<String>,
    pub attachments: Vec<DecodedAttachment>,
}

impl DecodedMessage {
    /// The first recipient, which decides local delivery
    #[must_use]
    pub fn primary_recipient(&self) -> Option<&str> {
        self.to.first().map(String::as_str)
    }
}

fn single_addresses(value: &str) -> Vec<String> {
    mailparse::addrparse(value)
        .map(|list| {
            list.iter()
                .flat_map(|addr| match addr {
                    MailAddr::Single(single) => vec![address::normalize(&single.addr)],
                    MailAddr::Group(group) => group
                        .addrs
                        .iter()
                        .map(|single| address::normalize(&single.addr))
                        .collect(),
                })
                .filter(|addr| !addr.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Default)]
struct Parts {
    text: Vec<String>,
    html: Vec<String>,
    attachments: Vec<DecodedAttachment>,
}

fn collect_parts(part: &ParsedMail<'_>, parts: &mut Parts) -> Result<(), DecodeError> {
    if !part.subparts.is_empty() {
        for child in &part.subparts {
            collect_parts(child, parts)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let mime = part.ctype.mimetype.to_ascii_lowercase();
    let is_attachment =
        matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some();

    if is_attachment {
        let content = part.get_body_raw()?;
        parts.attachments.push(DecodedAttachment {
            filename: filename
                .unwrap_or_else(|| format!("attachment-{}", parts.attachments.len() + 1)),
            content_type: if mime.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime
            },
            size: content.len(),
            content,
        });
    } else if mime == "text/html" {
        parts.html.push(part.get_body()?);
    } else if mime == "text/plain" || mime.is_empty() {
        parts.text.push(part.get_body()?);
    }

    Ok(())
}

/// Decode `raw` into a [`DecodedMessage`].
///
/// Missing `From`/`To` headers fall back to the envelope sender and first
/// envelope recipient. A message with neither is an error.
pub fn decode(raw: &[u8], envelope: &Envelope) -> Result<DecodedMessage, DecodeError> {
    let parsed = mailparse::parse_mail(raw)?;

    let mut from = parsed
        .headers
        .get_first_value("From")
        .map(|value| single_addresses(&value))
        .unwrap_or_default();
    let mut to = parsed
        .headers
        .get_first_value("To")
        .map(|value| single_addresses(&value))
        .unwrap_or_default();

    if from.is_empty()
        && let Some(sender) = envelope.sender()
    {
        from.push(sender.to_string());
    }

    if to.is_empty()
        && let Some(recipient) = envelope.recipients().first()
    {
        to.push(recipient.to_string());
    }

    if to.is_empty() {
        return Err(DecodeError::NoRecipient);
    }

    let from = from.into_iter().next().ok_or(DecodeError::NoSender)?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let mut parts = Parts::default();
    collect_parts(&parsed, &mut parts)?;

    Ok(DecodedMessage {
        from,
        to,
        subject,
        text: parts.text.join("\n"),
        html: parts.html.join("\n"),
        message_id,
        attachments: parts.attachments,
    })
}
