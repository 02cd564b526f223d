//! RFC 5322 rendering of messages handed to the relay.
//!
//! The same `from` and `to` values are written into the headers and used for
//! the SMTP envelope, so the two can never disagree.

use std::fmt::Write;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};

/// Base64 line length inside MIME parts (RFC 2045 allows up to 76)
const BASE64_LINE: usize = 76;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A message ready for transmission. Build with [`OutboundMessage::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    from: String,
    to: String,
    subject: String,
    text: String,
    html: String,
    message_id: String,
    date: DateTime<Utc>,
    attachments: Vec<OutboundAttachment>,
}

#[derive(Debug, Default)]
pub struct OutboundMessageBuilder {
    from: String,
    to: String,
    subject: String,
    text: String,
    html: String,
    message_id: Option<String>,
    date: Option<DateTime<Utc>>,
    attachments: Vec<OutboundAttachment>,
}

impl OutboundMessageBuilder {
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    /// Use an existing `Message-ID`, angle brackets included
    #[must_use]
    pub fn message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    #[must_use]
    pub fn attach(mut self, attachment: OutboundAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    #[must_use]
    pub fn attachments(mut self, attachments: impl IntoIterator<Item = OutboundAttachment>) -> Self {
        self.attachments.extend(attachments);
        self
    }

    /// Fill in `Date` and `Message-ID` if they were not given.
    #[must_use]
    pub fn build(self) -> OutboundMessage {
        let message_id = self.message_id.unwrap_or_else(|| {
            let domain = postbox_common::address::domain_of(&self.from).unwrap_or("localhost");
            format!("<{}@{domain}>", ulid::Ulid::new())
        });

        OutboundMessage {
            from: self.from,
            to: self.to,
            subject: self.subject,
            text: self.text,
            html: self.html,
            message_id,
            date: self.date.unwrap_or_else(Utc::now),
            attachments: self.attachments,
        }
    }
}

impl OutboundMessage {
    /// Start a message from `from` to `to`. Both are used verbatim in the
    /// envelope and in the headers.
    #[must_use]
    pub fn builder(from: impl Into<String>, to: impl Into<String>) -> OutboundMessageBuilder {
        OutboundMessageBuilder {
            from: from.into(),
            to: to.into(),
            ..OutboundMessageBuilder::default()
        }
    }

    /// Envelope sender
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Envelope recipient
    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn attachments(&self) -> &[OutboundAttachment] {
        &self.attachments
    }

    /// Render the message with CRLF line endings.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(1024);

        // Writing to a String cannot fail
        let _ = write!(out, "From: {}\r\n", self.from);
        let _ = write!(out, "To: {}\r\n", self.to);
        let _ = write!(out, "Subject: {}\r\n", encode_header(&self.subject));
        let _ = write!(out, "Date: {}\r\n", self.date.to_rfc2822());
        let _ = write!(out, "Message-ID: {}\r\n", self.message_id);
        out.push_str("MIME-Version: 1.0\r\n");

        let boundary = format!("postbox-{}", ulid::Ulid::new());

        if self.attachments.is_empty() {
            self.write_body(&mut out, &boundary);
        } else {
            let mixed = format!("{boundary}-mixed");
            let _ = write!(
                out,
                "Content-Type: multipart/mixed; boundary=\"{mixed}\"\r\n\r\n"
            );
            let _ = write!(out, "--{mixed}\r\n");
            self.write_body(&mut out, &boundary);

            for attachment in &self.attachments {
                let _ = write!(out, "--{mixed}\r\n");
                let _ = write!(
                    out,
                    "Content-Type: {}\r\n",
                    media_type(&attachment.content_type)
                );
                out.push_str("Content-Transfer-Encoding: base64\r\n");
                let _ = write!(
                    out,
                    "Content-Disposition: attachment; {}\r\n\r\n",
                    filename_param(&attachment.filename)
                );
                push_base64(&mut out, &attachment.content);
            }

            let _ = write!(out, "--{mixed}--\r\n");
        }

        out.into_bytes()
    }

    /// The text and HTML bodies, as `multipart/alternative` when both exist
    fn write_body(&self, out: &mut String, boundary: &str) {
        match (self.text.is_empty(), self.html.is_empty()) {
            (false, false) => {
                let alternative = format!("{boundary}-alt");
                let _ = write!(
                    out,
                    "Content-Type: multipart/alternative; boundary=\"{alternative}\"\r\n\r\n"
                );
                let _ = write!(out, "--{alternative}\r\n");
                push_text_part(out, "text/plain", &self.text);
                let _ = write!(out, "--{alternative}\r\n");
                push_text_part(out, "text/html", &self.html);
                let _ = write!(out, "--{alternative}--\r\n");
            }
            (true, false) => push_text_part(out, "text/html", &self.html),
            _ => push_text_part(out, "text/plain", &self.text),
        }
    }
}

fn push_text_part(out: &mut String, mime: &str, body: &str) {
    let _ = write!(out, "Content-Type: {mime}; charset=utf-8\r\n");
    out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    push_base64(out, body.as_bytes());
}

fn push_base64(out: &mut String, bytes: &[u8]) {
    let encoded = STANDARD.encode(bytes);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
}

/// RFC 2047 encoded-word for non-ASCII header values
fn encode_header(value: &str) -> String {
    let value = value.replace(['\r', '\n'], " ");
    if value.is_ascii() {
        value
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// `content_type` when it is a bare `type/subtype` token, otherwise
/// `application/octet-stream`
fn media_type(content_type: &str) -> &str {
    const FALLBACK: &str = "application/octet-stream";

    let is_token = |part: &str| {
        !part.is_empty()
            && part
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$&^_.+-".contains(&b))
    };

    match content_type.trim().split_once('/') {
        Some((kind, subtype)) if is_token(kind) && is_token(subtype) => content_type.trim(),
        _ => FALLBACK,
    }
}

/// The `filename` parameter of a Content-Disposition header. Line breaks
/// become spaces. Names that cannot sit inside a quoted string are written
/// as an RFC 2231 `filename*` with UTF-8 percent-encoding.
fn filename_param(filename: &str) -> String {
    let filename = filename.replace(['\r', '\n'], " ");
    let quotable = filename
        .bytes()
        .all(|b| (b' '..=b'~').contains(&b) && !matches!(b, b'"' | b'\\' | b';'));

    if quotable {
        return format!("filename=\"{filename}\"");
    }

    let mut param = String::from("filename*=utf-8''");
    for b in filename.bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            param.push(char::from(b));
        } else {
            let _ = write!(param, "%{b:02X}");
        }
    }
    param
}
