//! Email address normalisation and shape checks.
//!
//! Every address that crosses into storage or onto the wire goes through
//! [`normalize`], so comparisons elsewhere can be plain string equality.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Invalid email format: {0}")]
    MissingDomain(String),

    #[error("Invalid email format: {0}")]
    MissingLocalPart(String),

    #[error("Address contains whitespace: {0}")]
    Whitespace(String),
}

/// Trim, strip every surrounding `<...>` layer and lowercase an address.
///
/// Idempotent: `normalize(&normalize(a)) == normalize(a)`.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let mut address = raw.trim();
    while let Some(inner) = address
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
    {
        address = inner.trim();
    }

    address.to_lowercase()
}

/// Returns the domain part of an address, if it has one.
#[must_use]
pub fn domain_of(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

/// An address known to have the `local@domain` shape, stored normalised.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Normalise and validate `raw`.
    ///
    /// Only the shape is checked; any domain is accepted.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let address = normalize(raw);

        if address.is_empty() {
            return Err(AddressError::Empty);
        }

        if address.chars().any(char::is_whitespace) {
            return Err(AddressError::Whitespace(address));
        }

        match address.rsplit_once('@') {
            None => Err(AddressError::MissingDomain(address)),
            Some((_, "")) => Err(AddressError::MissingDomain(address)),
            Some(("", _)) => Err(AddressError::MissingLocalPart(address)),
            Some(_) => Ok(Self(address)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(local, _)| local)
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(_, domain)| domain)
    }

    /// Case-insensitive comparison of this address's domain against `domain`.
    #[must_use]
    pub fn is_in_domain(&self, domain: &str) -> bool {
        self.domain().eq_ignore_ascii_case(domain.trim())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Address {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}
