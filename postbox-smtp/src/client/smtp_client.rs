//! SMTP client with plain, implicit TLS and STARTTLS transports.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use postbox_common::tracing;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol error
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(
                handshake(stream, domain, accept_invalid_certs).await?,
            ))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

async fn handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// Accepts any server certificate. Only for relays with self-signed
/// certificates, enabled through `accept_invalid_certs`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    responses: Vec<Response>,
    capabilities: Vec<String>,
    server_domain: String,
    accept_invalid_certs: bool,
    timeout: Option<Duration>,
}

impl SmtpClient {
    fn with_connection(connection: ClientConnection, server_domain: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            responses: Vec::new(),
            capabilities: Vec::new(),
            server_domain,
            accept_invalid_certs: false,
            timeout: None,
        }
    }

    /// Connect over plain TCP. Use [`Self::starttls`] to upgrade later.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::with_connection(
            ClientConnection::Plain(stream),
            server_domain,
        ))
    }

    /// Connect with TLS from the first byte (SMTPS, usually port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: String,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let tls = handshake(stream, &server_domain, accept_invalid_certs).await?;

        Ok(Self::with_connection(
            ClientConnection::Tls(Box::new(tls)),
            server_domain,
        )
        .accept_invalid_certs(accept_invalid_certs))
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Bound every wait for a server reply.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(ClientConnection::is_tls)
    }

    /// Reads the initial server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command to the server without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        let data = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO and records the extensions the server advertises.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;

        if response.is_success() {
            self.capabilities = response
                .lines
                .iter()
                .skip(1)
                .map(|line| line.trim().to_ascii_uppercase())
                .collect();
        }

        Ok(response)
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Whether the last EHLO advertised `extension`, e.g. `STARTTLS`
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.capabilities.iter().any(|capability| {
            capability
                .split_whitespace()
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// The SASL mechanisms listed on the `AUTH` line of the last EHLO
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter_map(|capability| {
                capability
                    .strip_prefix("AUTH ")
                    .or_else(|| capability.strip_prefix("AUTH="))
            })
            .flat_map(str::split_whitespace)
            .collect()
    }

    /// `AUTH PLAIN` with the credentials sent as an initial response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the server rejects the credentials.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        self.command(&format!("AUTH PLAIN {token}"))
            .await?
            .into_result()
    }

    /// `AUTH LOGIN`, answering the username and password prompts in turn.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the server rejects the credentials.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        self.command("AUTH LOGIN").await?.into_result()?;
        self.command(&STANDARD.encode(username))
            .await?
            .into_result()?;
        self.command(&STANDARD.encode(password))
            .await?
            .into_result()
    }

    /// Authenticate with whichever of PLAIN or LOGIN the server offers,
    /// preferring PLAIN.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<Response> {
        let mechanisms = self.auth_mechanisms();
        if mechanisms.contains(&"LOGIN") && !mechanisms.contains(&"PLAIN") {
            self.auth_login(username, password).await
        } else {
            self.auth_plain(username, password).await
        }
    }

    /// Sends MAIL FROM. An empty `from` sends the null reverse-path.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let cmd = if let Some(size) = size {
            format!("MAIL FROM:<{from}> SIZE={size}")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.command(&cmd).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends message content, dot-stuffed and CRLF terminated, followed by
    /// the end-of-data marker.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let payload = dot_stuff(data);

        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(&payload).await?;
        connection.send(b".\r\n").await?;

        self.read_response().await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends STARTTLS and upgrades the connection on success. Extensions
    /// from before the upgrade are discarded; send EHLO again.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS fails or TLS upgrade fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let old_connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                old_connection
                    .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                    .await?,
            );
            self.capabilities.clear();
        }

        Ok(response)
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    #[must_use]
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    #[must_use]
    pub fn last_response(&self) -> Option<&Response> {
        self.responses.last()
    }

    async fn read_response(&mut self) -> Result<Response> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_response_inner())
                .await
                .map_err(|_| ClientError::Timeout(limit.as_secs()))?,
            None => self.read_response_inner().await,
        }
    }

    async fn read_response_inner(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                tracing::trace!(code = response.code, "SMTP reply: {}", response.message());
                self.responses.push(response.clone());

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Normalise line endings to CRLF, double any leading dot
/// (RFC 5321 Section 4.5.2) and make sure the content ends with CRLF.
#[must_use]
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 2);

    for line in data.split_inclusive(|&b| b == b'\n') {
        let content = line
            .strip_suffix(b"\n")
            .map_or(line, |l| l.strip_suffix(b"\r").unwrap_or(l));

        if content.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing() {
        assert_eq!(dot_stuff(b"a\n.b\r\n..c"), b"a\r\n..b\r\n...c\r\n");
        assert_eq!(dot_stuff(b"hello\r\n"), b"hello\r\n");
        assert!(dot_stuff(b"").is_empty());
    }

    #[tokio::test]
    async fn parses_capabilities_and_authenticates() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"220 relay ready\r\n").await.unwrap();

            let mut buf = vec![0u8; 1024];
            let mut seen = Vec::new();
            for reply in [
                &b"250-relay\r\n250-AUTH LOGIN PLAIN\r\n250 SIZE 1000\r\n"[..],
                b"235 2.7.0 ok\r\n",
                b"221 bye\r\n",
            ] {
                let n = stream.read(&mut buf).await.unwrap();
                seen.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(reply).await.unwrap();
            }
            seen
        });

        let mut client = SmtpClient::connect(&addr.to_string(), "relay".to_string())
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        assert_eq!(client.read_greeting().await.unwrap().code, 220);
        client.ehlo("client").await.unwrap();

        assert!(client.supports("size"));
        assert!(!client.supports("STARTTLS"));
        assert_eq!(client.auth_mechanisms(), vec!["LOGIN", "PLAIN"]);

        assert_eq!(client.authenticate("u", "p").await.unwrap().code, 235);
        client.quit().await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[1], format!("AUTH PLAIN {}\r\n", STANDARD.encode("\0u\0p")));
        assert_eq!(client.responses().len(), 4);
    }
}
