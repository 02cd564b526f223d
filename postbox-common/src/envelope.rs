use crate::address::Address;

/// The SMTP envelope collected by MAIL FROM and RCPT TO.
///
/// A `None` sender is the null reverse-path (`MAIL FROM:<>`).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Vec<Address>,
}

impl Envelope {
    /// Returns the envelope sender, if one was given
    #[inline]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Returns a mutable reference to the envelope sender
    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// Returns the accepted recipients, in the order they were given
    #[inline]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Add a recipient, ignoring exact duplicates
    pub fn add_recipient(&mut self, recipient: Address) {
        if !self.recipients.contains(&recipient) {
            self.recipients.push(recipient);
        }
    }

    /// Drop the most recently added recipient, used when RCPT TO validation rejects it
    pub fn pop_recipient(&mut self) -> Option<Address> {
        self.recipients.pop()
    }

    /// Clear sender and recipients ready for the next transaction
    pub fn clear(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}
