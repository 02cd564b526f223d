//! DKIM signing (RFC 6376), rsa-sha256 with relaxed header and simple body
//! canonicalization.

use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::DkimConfig;

/// Headers covered by the signature, in `h=` order
pub const SIGNED_HEADERS: [&str; 5] = ["from", "to", "subject", "date", "message-id"];

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("Unable to read DKIM key {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid DKIM private key: {0}")]
    Key(String),

    #[error("DKIM signing failed: {0}")]
    Sign(String),
}

/// Signs outgoing messages for one domain and selector.
#[derive(Clone)]
pub struct DkimSigner {
    domain: String,
    selector: String,
    key: SigningKey<Sha256>,
}

impl std::fmt::Debug for DkimSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimSigner")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl DkimSigner {
    #[must_use]
    pub fn new(domain: impl Into<String>, selector: impl Into<String>, key: RsaPrivateKey) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            key: SigningKey::<Sha256>::new(key),
        }
    }

    /// Parse a PEM key, PKCS#8 first and then PKCS#1.
    pub fn from_pem(
        domain: impl Into<String>,
        selector: impl Into<String>,
        pem: &str,
    ) -> Result<Self, DkimError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| DkimError::Key(e.to_string()))?;

        Ok(Self::new(domain, selector, key))
    }

    /// Load the key named by `config`
    pub async fn from_config(config: &DkimConfig) -> Result<Self, DkimError> {
        let pem = read_key(&config.private_key).await?;
        Self::from_pem(&config.domain, &config.selector, &pem)
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Prepend a `DKIM-Signature` header to `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, DkimError> {
        self.sign_at(message, chrono::Utc::now().timestamp())
    }

    /// [`Self::sign`] with a fixed `t=` timestamp
    pub fn sign_at(&self, message: &[u8], timestamp: i64) -> Result<Vec<u8>, DkimError> {
        let (headers, body) = split_message(message);
        let body_hash = STANDARD.encode(Sha256::digest(canonical_body(body)));

        let fields = parse_headers(headers);
        let signed: Vec<&str> = SIGNED_HEADERS
            .iter()
            .copied()
            .filter(|name| find_header(&fields, name).is_some())
            .collect();

        let tags = format!(
            "v=1; a=rsa-sha256; c=relaxed/simple; d={}; s={}; t={timestamp}; bh={body_hash}; h={}; b=",
            self.domain,
            self.selector,
            signed.join(":"),
        );

        let mut signing_input = String::new();
        for name in &signed {
            if let Some(value) = find_header(&fields, name) {
                signing_input.push_str(&relaxed_header(name, value));
                signing_input.push_str("\r\n");
            }
        }
        // The signature header itself, without its trailing CRLF
        signing_input.push_str(&relaxed_header("dkim-signature", &tags));

        let signature = self
            .key
            .try_sign(signing_input.as_bytes())
            .map_err(|e| DkimError::Sign(e.to_string()))?;
        let encoded = STANDARD.encode(signature.to_bytes());

        let mut header = format!("DKIM-Signature: {tags}");
        for (i, chunk) in encoded.as_bytes().chunks(72).enumerate() {
            if i > 0 {
                header.push_str("\r\n\t");
            }
            header.push_str(&String::from_utf8_lossy(chunk));
        }
        header.push_str("\r\n");

        let mut signed_message = header.into_bytes();
        signed_message.extend_from_slice(message);
        Ok(signed_message)
    }
}

async fn read_key(path: &Path) -> Result<String, DkimError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DkimError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Split at the first empty line. A message without one is all headers.
fn split_message(message: &[u8]) -> (&[u8], &[u8]) {
    message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or((message, &[][..]), |pos| {
            (&message[..pos + 2], &message[pos + 4..])
        })
}

/// Header fields as (name, unfolded raw value) pairs, in order
fn parse_headers(headers: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(headers);
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push_str(line);
            }
        } else if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim().to_string(), value.to_string()));
        }
    }

    fields
}

/// The last instance of `name`, which is the one a verifier picks first
fn find_header<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .rev()
        .find(|(field, _)| field.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Relaxed header canonicalization (RFC 6376 Section 3.4.2)
fn relaxed_header(name: &str, value: &str) -> String {
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}:{value}", name.to_ascii_lowercase())
}

/// Simple body canonicalization (RFC 6376 Section 3.4.3): trailing empty
/// lines are reduced to a single CRLF, and an empty body becomes one CRLF.
fn canonical_body(body: &[u8]) -> Vec<u8> {
    let mut end = body.len();
    while end >= 2 && &body[end - 2..end] == b"\r\n" {
        end -= 2;
    }

    let mut canonical = body[..end].to_vec();
    canonical.extend_from_slice(b"\r\n");
    canonical
}
