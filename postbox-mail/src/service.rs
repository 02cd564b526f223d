//! Create, receive and send orchestration over the stores and the relay.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use postbox_common::{
    address::{self, Address},
    internal,
    mime::{DecodedAttachment, DecodedMessage},
    model::{Attachment, Mailbox, MailboxId, Message, MessageId, MessageStatus, NO_SUBJECT},
};
use postbox_store::{AttachmentStore, InsertOutcome, MailboxDirectory, MessageStore};
use tracing::warn;

use crate::{
    error::MailError,
    outbound::{OutboundAttachment, OutboundMessage},
    relay::RelayTransport,
};

/// Page size for [`MailService::list_mails`] when the caller has no opinion
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// A draft as supplied by the API layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub attachments: Vec<OutboundAttachment>,
}

#[derive(Debug, Clone)]
pub struct MailService {
    domain: String,
    mailboxes: Arc<dyn MailboxDirectory>,
    messages: Arc<dyn MessageStore>,
    attachments: Arc<dyn AttachmentStore>,
    relay: Arc<dyn RelayTransport>,
    max_attachment_size: u64,
}

impl MailService {
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        mailboxes: Arc<dyn MailboxDirectory>,
        messages: Arc<dyn MessageStore>,
        attachments: Arc<dyn AttachmentStore>,
        relay: Arc<dyn RelayTransport>,
    ) -> Self {
        Self {
            domain: address::normalize(&domain.into()),
            mailboxes,
            messages,
            attachments,
            relay,
            max_attachment_size: 0,
        }
    }

    /// Reject attachments larger than `bytes`. Zero disables the check.
    #[must_use]
    pub const fn with_max_attachment_size(mut self, bytes: u64) -> Self {
        self.max_attachment_size = bytes;
        self
    }

    /// The domain this server stores mail for
    #[must_use]
    pub fn authoritative_domain(&self) -> &str {
        &self.domain
    }

    /// Whether mail for `address` is stored here rather than passed through
    #[must_use]
    pub fn is_local(&self, address: &str) -> bool {
        address::domain_of(&address::normalize(address)) == Some(self.domain.as_str())
    }

    pub async fn find_mailbox(&self, address: &str) -> Result<Option<Mailbox>, MailError> {
        Ok(self.mailboxes.find(&address::normalize(address)).await?)
    }

    /// Store a draft owned by the sender's mailbox.
    ///
    /// # Errors
    /// [`MailError::MissingSender`] without a sender, and
    /// [`MailError::MailboxNotFound`] when the sender has no mailbox here
    pub async fn create_mail(&self, draft: DraftMail) -> Result<Message, MailError> {
        if draft.from.trim().is_empty() {
            return Err(MailError::MissingSender);
        }
        let from = Address::parse(&draft.from)?;
        let to = address::normalize(&draft.to);

        let mailbox = self
            .mailboxes
            .find(from.as_str())
            .await?
            .ok_or_else(|| MailError::MailboxNotFound(from.to_string()))?;

        let id = MessageId::generate();
        let message = Message {
            id,
            mailbox_id: mailbox.id,
            from: from.to_string(),
            to,
            subject: subject_or_default(draft.subject),
            text: draft.text,
            html: draft.html,
            attachments: Vec::new(),
            status: MessageStatus::Draft,
            message_id: Some(format!("<{}@{}>", ulid::Ulid::new(), self.domain)),
            created_at: Utc::now(),
        };

        let mut message = self.messages.insert(message).await?;

        if !draft.attachments.is_empty() {
            let uploads = draft.attachments.iter().map(|attachment| {
                self.upload(
                    id,
                    &attachment.filename,
                    &attachment.content_type,
                    &attachment.content,
                )
            });
            message.attachments = join_all(uploads).await;
            self.messages.update(&message).await?;
        }

        internal!(
            level = INFO,
            "Draft {} created for {} ({} attachments)",
            message.id,
            message.from,
            message.attachments.len()
        );
        Ok(message)
    }

    /// Store an inbound message for its primary recipient.
    ///
    /// A repeated protocol message-id returns the stored message and uploads
    /// nothing. Attachment failures are recorded on the message and never
    /// fail the receive.
    ///
    /// # Errors
    /// [`MailError::MissingRecipient`] or [`MailError::MailboxNotFound`]
    pub async fn receive_mail(&self, decoded: DecodedMessage) -> Result<Message, MailError> {
        let recipient = decoded
            .primary_recipient()
            .map(address::normalize)
            .filter(|recipient| !recipient.is_empty())
            .ok_or(MailError::MissingRecipient)?;

        let mailbox = self
            .mailboxes
            .find(&recipient)
            .await?
            .ok_or_else(|| MailError::MailboxNotFound(recipient.clone()))?;

        let id = MessageId::generate();
        let message = Message {
            id,
            mailbox_id: mailbox.id,
            from: address::normalize(&decoded.from),
            to: recipient,
            subject: subject_or_default(decoded.subject),
            text: decoded.text,
            html: decoded.html,
            attachments: Vec::new(),
            status: MessageStatus::Received,
            message_id: decoded.message_id,
            created_at: Utc::now(),
        };

        let mut message = match self.messages.insert_if_absent(message.clone()).await? {
            InsertOutcome::Inserted(message) => message,
            InsertOutcome::Existing(existing)
                if matches!(existing.status, MessageStatus::Received) =>
            {
                internal!(
                    level = INFO,
                    "Duplicate message-id {:?}, keeping stored message {}",
                    existing.message_id,
                    existing.id
                );
                return Ok(existing);
            }
            // Our own outgoing mail coming back in. The id stays with the
            // outgoing copy, the inbound one is stored without it.
            InsertOutcome::Existing(existing) => {
                internal!(
                    level = INFO,
                    "Message-id {:?} belongs to {:?} message {}, storing {} without it",
                    existing.message_id,
                    existing.status,
                    existing.id,
                    message.id
                );
                self.messages
                    .insert(Message {
                        message_id: None,
                        ..message
                    })
                    .await?
            }
        };

        if !decoded.attachments.is_empty() {
            let uploads = decoded
                .attachments
                .iter()
                .map(|attachment: &DecodedAttachment| {
                    self.upload(
                        id,
                        &attachment.filename,
                        &attachment.content_type,
                        &attachment.content,
                    )
                });
            message.attachments = join_all(uploads).await;
            self.messages.update(&message).await?;
        }

        internal!(
            level = INFO,
            "Received {} for {} from {} ({} of {} attachments stored)",
            message.id,
            message.to,
            message.from,
            message.attachments.iter().filter(|a| a.is_stored()).count(),
            message.attachments.len()
        );
        Ok(message)
    }

    /// Relay a draft and record the outcome on it.
    ///
    /// Overrides win over the stored addresses. Stored attachments are
    /// downloaded again; any that cannot be read are left out of the
    /// transmission.
    ///
    /// # Errors
    /// [`MailError::MessageNotFound`], a [`MailError::Status`] for anything
    /// other than a draft, and [`MailError::Relay`] after the message was
    /// marked failed
    pub async fn send_mail(
        &self,
        id: MessageId,
        from_override: Option<&str>,
        to_override: Option<&str>,
    ) -> Result<Message, MailError> {
        let mut message = self.get_mail(id).await?;
        if !message.status.can_transition_to(MessageStatus::Sent) {
            return Err(MailError::Status(
                postbox_common::model::StatusTransitionError {
                    from: message.status,
                    to: MessageStatus::Sent,
                },
            ));
        }

        let from = resolve(from_override, &message.from).ok_or(MailError::MissingSender)?;
        let to = resolve(to_override, &message.to).ok_or(MailError::MissingRecipient)?;
        let from = Address::parse(&from)?;
        let to = Address::parse(&to)?;

        let attachments = self.download_all(&message).await;

        let outbound = OutboundMessage::builder(from.as_str(), to.as_str())
            .subject(message.subject.clone())
            .text(message.text.clone())
            .html(message.html.clone())
            .message_id(message.message_id.clone())
            .attachments(attachments)
            .build();

        match self.relay.send(&outbound).await {
            Ok(receipt) => {
                message.transition(MessageStatus::Sent)?;
                self.messages.update(&message).await?;
                internal!(
                    level = INFO,
                    "Mail {} sent from {} to {} ({} attachments): {}",
                    message.id,
                    outbound.from(),
                    outbound.to(),
                    outbound.attachments().len(),
                    receipt.code
                );
                Ok(message)
            }
            Err(err) => {
                message.transition(MessageStatus::Failed)?;
                if let Err(store_err) = self.messages.update(&message).await {
                    warn!("Unable to mark {} failed: {store_err}", message.id);
                }
                warn!("Relay of {} failed: {err}", message.id);
                Err(err.into())
            }
        }
    }

    pub async fn get_mail(&self, id: MessageId) -> Result<Message, MailError> {
        self.messages
            .get(id)
            .await?
            .ok_or_else(|| MailError::MessageNotFound(id.to_string()))
    }

    /// Messages in `mailbox`, newest first
    pub async fn list_mails(
        &self,
        mailbox: MailboxId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, MailError> {
        Ok(self
            .messages
            .list_by_mailbox(mailbox, limit, offset)
            .await?)
    }

    async fn upload(
        &self,
        id: MessageId,
        filename: &str,
        content_type: &str,
        content: &[u8],
    ) -> Attachment {
        let size = content.len() as u64;
        let failed = |error: String| Attachment {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size,
            storage_key: None,
            locator: None,
            error: Some(error),
        };

        if self.max_attachment_size > 0 && size > self.max_attachment_size {
            warn!(
                "Attachment {filename} on {id} is {size} bytes, over the {} byte limit",
                self.max_attachment_size
            );
            return failed("attachment exceeds maximum size".to_string());
        }

        match self
            .attachments
            .put(id, content, filename, content_type)
            .await
        {
            Ok(stored) => Attachment {
                filename: stored.filename,
                content_type: stored.content_type,
                size: stored.size,
                storage_key: Some(stored.key),
                locator: Some(stored.locator),
                error: None,
            },
            Err(err) => {
                warn!("Upload of attachment {filename} on {id} failed: {err}");
                failed(err.to_string())
            }
        }
    }

    async fn download_all(&self, message: &Message) -> Vec<OutboundAttachment> {
        let downloads = message.attachments.iter().map(|attachment| async move {
            let Some(key) = attachment.storage_key.as_deref() else {
                warn!(
                    "Attachment {} on {} was never stored, sending without it",
                    attachment.filename, message.id
                );
                return None;
            };

            match self.attachments.get(key).await {
                Ok(content) => Some(OutboundAttachment {
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    content,
                }),
                Err(err) => {
                    warn!(
                        "Download of attachment {} on {} failed, sending without it: {err}",
                        attachment.filename, message.id
                    );
                    None
                }
            }
        });

        join_all(downloads).await.into_iter().flatten().collect()
    }
}

fn subject_or_default(subject: String) -> String {
    if subject.trim().is_empty() {
        NO_SUBJECT.to_string()
    } else {
        subject
    }
}

/// The normalised override, else the normalised stored value, if non-empty
fn resolve(override_value: Option<&str>, stored: &str) -> Option<String> {
    override_value
        .map(address::normalize)
        .filter(|value| !value.is_empty())
        .or_else(|| Some(address::normalize(stored)))
        .filter(|value| !value.is_empty())
}
