//! Operator subcommands that run once and exit.

use std::io::{BufRead, Write};

use anyhow::{Context as _, bail};
use postbox_common::model::{Attachment, MailboxId, Message, MessageId, MessageStatus};
use postbox_mail::SmtpRelay;
use postbox_store::{MessageStore, credentials};
use serde::Serialize;

use crate::config::Config;

/// Print the relay settings, secrets masked, then try a connection with
/// EHLO, AUTH and QUIT.
pub async fn check_relay(config: &Config, out: &mut impl Write) -> anyhow::Result<()> {
    writeln!(out, "{:#?}", config.relay)?;

    if let Err(err) = config.relay.credentials() {
        writeln!(out, "Relay is not usable: {err}")?;
        return Err(err.into());
    }

    let relay = SmtpRelay::new(config.relay.clone(), config.banner());
    relay
        .check()
        .await
        .with_context(|| format!("Relay check against {} failed", config.relay.address()))?;

    writeln!(out, "Relay {} accepted our credentials", config.relay.address())?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AuditFormat {
    #[default]
    Text,
    Json,
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    id: MessageId,
    mailbox_id: MailboxId,
    status: MessageStatus,
    attachments: Vec<&'a Attachment>,
}

impl<'a> AuditEntry<'a> {
    fn from_message(message: &'a Message) -> Option<Self> {
        let attachments: Vec<_> = message
            .attachments
            .iter()
            .filter(|attachment| !attachment.is_stored())
            .collect();

        (!attachments.is_empty()).then_some(Self {
            id: message.id,
            mailbox_id: message.mailbox_id,
            status: message.status,
            attachments,
        })
    }
}

/// List every message holding an attachment that has no storage key or
/// locator. The bytes for those attachments were never stored.
///
/// Returns the number of messages listed.
pub async fn audit_attachments(
    store: &dyn MessageStore,
    format: AuditFormat,
    out: &mut impl Write,
) -> anyhow::Result<usize> {
    let messages = store
        .all()
        .await
        .context("Unable to read the message store")?;
    let entries: Vec<_> = messages.iter().filter_map(AuditEntry::from_message).collect();

    match format {
        AuditFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &entries)?;
            writeln!(out)?;
        }
        AuditFormat::Text => {
            for entry in &entries {
                writeln!(
                    out,
                    "{} ({:?}, mailbox {}):",
                    entry.id, entry.status, entry.mailbox_id
                )?;
                for attachment in &entry.attachments {
                    writeln!(
                        out,
                        "  {} [{}]: {}",
                        attachment.filename,
                        attachment.content_type,
                        attachment.error.as_deref().unwrap_or("no storage key")
                    )?;
                }
            }
            writeln!(
                out,
                "{} of {} messages have unrecoverable attachments",
                entries.len(),
                messages.len()
            )?;
        }
    }

    Ok(entries.len())
}

/// Read one password line from `input` and return its argon2 PHC hash.
pub fn hash_password(mut input: impl BufRead) -> anyhow::Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Unable to read password")?;

    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    Ok(credentials::hash_password(password)?)
}

#[cfg(test)]
mod tests {
    use postbox_store::MemoryMessageStore;
    use pretty_assertions::assert_eq;

    use super::*;

    fn message(attachments: Vec<Attachment>) -> Message {
        Message {
            id: MessageId::generate(),
            mailbox_id: MailboxId::generate(),
            from: "a@x.me".to_string(),
            to: "b@y.com".to_string(),
            subject: "Hi".to_string(),
            text: String::new(),
            html: String::new(),
            attachments,
            status: MessageStatus::Received,
            message_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn attachment(filename: &str, stored: bool) -> Attachment {
        Attachment {
            filename: filename.to_string(),
            content_type: "text/plain".to_string(),
            size: 4,
            storage_key: stored.then(|| format!("mails/x/{filename}")),
            locator: stored.then(|| format!("file:///tmp/{filename}")),
            error: (!stored).then(|| "upload failed".to_string()),
        }
    }

    #[tokio::test]
    async fn audit_lists_only_broken_messages() {
        let store = MemoryMessageStore::new();
        let broken = message(vec![attachment("ok.txt", true), attachment("gone.txt", false)]);
        store.insert(broken.clone()).await.unwrap();
        store
            .insert(message(vec![attachment("fine.txt", true)]))
            .await
            .unwrap();
        store.insert(message(Vec::new())).await.unwrap();

        let mut out = Vec::new();
        let affected = audit_attachments(&store, AuditFormat::Text, &mut out)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let report = String::from_utf8(out).unwrap();
        assert!(report.contains(&broken.id.to_string()));
        assert!(report.contains("gone.txt [text/plain]: upload failed"));
        assert!(!report.contains("ok.txt"));
        assert!(!report.contains("fine.txt"));
        assert!(report.ends_with("1 of 3 messages have unrecoverable attachments\n"));
    }

    #[tokio::test]
    async fn audit_json_lists_broken_attachments() {
        let store = MemoryMessageStore::new();
        let broken = message(vec![attachment("ok.txt", true), attachment("gone.txt", false)]);
        store.insert(broken.clone()).await.unwrap();

        let mut out = Vec::new();
        audit_attachments(&store, AuditFormat::Json, &mut out)
            .await
            .unwrap();

        let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let entries = report.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], serde_json::json!(broken.id));
        assert_eq!(entries[0]["attachments"].as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["attachments"][0]["filename"], "gone.txt");
        assert!(entries[0]["attachments"][0]["storage_key"].is_null());
    }

    #[test]
    fn hash_password_reads_one_line() {
        let hash = hash_password(&b"hunter2\nignored\n"[..]).unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(credentials::verify_password("hunter2", &hash));
        assert!(!credentials::verify_password("hunter2\n", &hash));
    }

    #[test]
    fn empty_password_is_refused() {
        assert!(hash_password(&b"\n"[..]).is_err());
        assert!(hash_password(&b""[..]).is_err());
    }

    #[tokio::test]
    async fn check_relay_without_credentials_fails_before_connecting() {
        let mut config = Config::default();
        config.relay.username = None;
        config.relay.password = None;
        config.relay.api_key = None;

        let mut out = Vec::new();
        let err = check_relay(&config, &mut out).await.unwrap_err();
        assert!(err.to_string().contains("credentials not configured"));

        let report = String::from_utf8(out).unwrap();
        assert!(report.contains("Relay is not usable"));
    }

    #[tokio::test]
    async fn check_relay_masks_secrets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = Config::default();
        config.relay.host = "127.0.0.1".to_string();
        config.relay.port = port;
        config.relay.username = Some("relay-user".to_string());
        config.relay.password = Some("very-secret-password".to_string());
        config.relay.timeout_secs = 2;

        let mut out = Vec::new();
        assert!(check_relay(&config, &mut out).await.is_err());

        let report = String::from_utf8(out).unwrap();
        assert!(report.contains("relay-user"));
        assert!(!report.contains("very-secret-password"));
    }
}
