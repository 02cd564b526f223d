//! Attachment storage keys.
//!
//! Keys look like `mails/{message_id}/{ulid}-{filename}` and are used as
//! relative paths by the file backend, so anything that could escape the
//! storage root is rejected.

use postbox_common::model::MessageId;

use crate::{Result, StoreError};

const MAX_FILENAME: usize = 128;

/// Prefix under which all attachments of `message_id` live
#[must_use]
pub fn message_prefix(message_id: MessageId) -> String {
    format!("mails/{message_id}/")
}

/// Build a fresh, unique key for an attachment of `message_id`
#[must_use]
pub fn attachment_key(message_id: MessageId, filename: &str) -> String {
    format!(
        "{}{}-{}",
        message_prefix(message_id),
        ulid::Ulid::new(),
        sanitize_filename(filename)
    )
}

/// Reduce a client supplied filename to `[A-Za-z0-9._-]`.
///
/// Leading dots are dropped so the result is never hidden or `..`.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    let cleaned: String = cleaned.chars().take(MAX_FILENAME).collect();

    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Check that `key` is a relative, traversal free path
pub fn validate(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }

    Ok(())
}
