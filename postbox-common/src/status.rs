use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the listener and understood by the relay client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage,
    ServiceReady,
    GoodBye,
    AuthSuccess,
    Ok,
    AuthContinue,
    StartMailInput,
    Unavailable,
    MailboxBusy,
    ActionUnavailable,
    SyntaxError,
    ParameterError,
    NotImplemented,
    InvalidCommandSequence,
    ParameterNotImplemented,
    AuthRequired,
    AuthInvalid,
    Error,
    ExceededStorage,
    MailboxNameInvalid,
    TransactionFailed,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }

    /// Checks if the status is a positive completion or intermediate reply
    pub fn is_positive(self) -> bool {
        u32::from(self) < 400
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccess,
            250 => Self::Ok,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            450 => Self::MailboxBusy,
            451 => Self::ActionUnavailable,
            500 => Self::SyntaxError,
            501 => Self::ParameterError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthRequired,
            535 => Self::AuthInvalid,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            553 => Self::MailboxNameInvalid,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccess => 235,
            Status::Ok => 250,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::MailboxBusy => 450,
            Status::ActionUnavailable => 451,
            Status::SyntaxError => 500,
            Status::ParameterError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthRequired => 530,
            Status::AuthInvalid => 535,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::MailboxNameInvalid => 553,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn status() {
        assert!(Status::Error.is_permanent());
        assert!(!Status::Error.is_temporary());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert!(Status::AuthContinue.is_positive());
        assert!(!Status::AuthInvalid.is_positive());

        assert_eq!(Status::from(550), Status::Error);
        assert_eq!(u32::from(Status::Error), 550);
        assert_eq!(Status::from(299), Status::Unknown(299));
    }

    #[test]
    fn codes_round_trip_through_u32() {
        for code in [
            214, 220, 221, 235, 250, 334, 354, 421, 450, 451, 500, 501, 502, 503, 504, 530, 535,
            550, 552, 553, 554,
        ] {
            assert_eq!(u32::from(Status::from(code)), code);
            assert!(!matches!(Status::from(code), Status::Unknown(_)));
        }
    }
}
