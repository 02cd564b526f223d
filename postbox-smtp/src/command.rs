use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;

/// ESMTP parameters for the MAIL FROM command (RFC 5321 Section 3.3).
///
/// Keys are stored uppercased, so lookups are case-insensitive.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

const KNOWN_PARAMS: [&str; 6] = ["SIZE", "BODY", "AUTH", "RET", "ENVID", "SMTPUTF8"];

fn normalize_key(key: &str) -> Cow<'static, str> {
    KNOWN_PARAMS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(key))
        .map_or_else(|| Cow::Owned(key.to_ascii_uppercase()), |&s| Cow::Borrowed(s))
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `KEY=VALUE` and `FLAG` tokens.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if a parameter is repeated, or
    /// if SIZE is zero or not a number.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };

            let key = normalize_key(key);
            if params.has(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.map(str::parse::<usize>) {
                    Some(Ok(0)) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(Ok(_)) => {}
                    _ => return Err(format!("Invalid SIZE value: {}", value.unwrap_or(""))),
                }
            }

            params.params.insert(key, value.map(str::to_string));
        }

        Ok(params)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params
            .insert(normalize_key(&key.into()), Some(value.into()));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(normalize_key(key).as_ref())?.as_deref()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(normalize_key(key).as_ref())
    }

    /// The declared SIZE, if any (RFC 1870)
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;

            match v {
                None => f.write_str(k)?,
                Some(val) => write!(f, "{k}={val}")?,
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// SASL mechanisms a client may name in `AUTH`.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum AuthMechanism {
    Plain,
    Login,
    Other(String),
}

impl From<&str> for AuthMechanism {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case("PLAIN") {
            Self::Plain
        } else if value.eq_ignore_ascii_case("LOGIN") {
            Self::Login
        } else {
            Self::Other(value.to_ascii_uppercase())
        }
    }
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("PLAIN"),
            Self::Login => f.write_str("LOGIN"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// The raw reverse-path, with `None` for the null sender (`MAIL FROM:<>`).
    /// Shape validation happens in the state machine so the rejection can
    /// carry a proper reply code.
    MailFrom(Option<String>, MailParameters),
    RcptTo(String),
    /// Mechanism and optional initial response
    Auth(AuthMechanism, Option<String>),
    /// A line sent in answer to a `334` challenge
    AuthResponse(String),
    Data,
    Rset,
    Noop,
    Help,
    Quit,
    StartTLS,
    /// Unrecognised command
    Invalid(String),
    /// A recognised command with unusable arguments
    Malformed(String),
}

impl Command {
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::MailFrom(_, params) => params.size(),
            _ => None,
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(fmt, "{v} {id}")
            }
            Self::MailFrom(sender, params) => {
                let sender = sender.as_deref().unwrap_or("<>");
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:{sender}")
                } else {
                    write!(fmt, "MAIL FROM:{sender} {params}")
                }
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:{rcpt}"),
            Self::Auth(mechanism, None) => write!(fmt, "AUTH {mechanism}"),
            Self::Auth(mechanism, Some(_)) => write!(fmt, "AUTH {mechanism} <redacted>"),
            Self::AuthResponse(_) => fmt.write_str("AUTH <redacted>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Help => fmt.write_str("HELP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTLS => fmt.write_str("STARTTLS"),
            Self::Invalid(s) | Self::Malformed(s) => fmt.write_str(s),
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &value[prefix.len()..])
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "MAIL FROM:") {
            let rest = rest.trim();
            let (addr, params) = rest
                .split_once(char::is_whitespace)
                .unwrap_or((rest, ""));

            if addr.is_empty() {
                return Err(Self::Malformed("Expected a sender address".to_string()));
            }

            let params = MailParameters::from_params_str(params).map_err(Self::Malformed)?;

            if addr == "<>" {
                return Ok(Self::MailFrom(None, params));
            }

            return Ok(Self::MailFrom(Some(addr.to_string()), params));
        }

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "RCPT TO:") {
            let rest = rest.trim();
            let addr = rest.split_whitespace().next().unwrap_or_default();

            if addr.is_empty() {
                return Err(Self::Malformed("Expected a recipient address".to_string()));
            }

            return Ok(Self::RcptTo(addr.to_string()));
        }

        let (verb, argument) = trimmed
            .split_once(' ')
            .map_or((trimmed, ""), |(verb, argument)| (verb, argument.trim()));

        if verb.eq_ignore_ascii_case("EHLO") || verb.eq_ignore_ascii_case("HELO") {
            if argument.is_empty() {
                return Err(Self::Malformed(format!("Expected hostname in {trimmed}")));
            }

            return Ok(Self::Helo(if verb.eq_ignore_ascii_case("HELO") {
                HeloVariant::Helo(argument.to_string())
            } else {
                HeloVariant::Ehlo(argument.to_string())
            }));
        }

        if verb.eq_ignore_ascii_case("AUTH") {
            let mut parts = argument.split_whitespace();
            let Some(mechanism) = parts.next() else {
                return Err(Self::Malformed(
                    "Expected an authentication mechanism".to_string(),
                ));
            };

            return Ok(Self::Auth(
                AuthMechanism::from(mechanism),
                parts.next().map(str::to_string),
            ));
        }

        let simple = [
            ("DATA", Self::Data),
            ("QUIT", Self::Quit),
            ("RSET", Self::Rset),
            ("NOOP", Self::Noop),
            ("HELP", Self::Help),
            ("STARTTLS", Self::StartTLS),
        ];

        simple
            .into_iter()
            .find(|(name, _)| verb.eq_ignore_ascii_case(name))
            .map(|(_, command)| command)
            .ok_or_else(|| Self::Invalid(trimmed.to_owned()))
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
