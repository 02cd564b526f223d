use std::{borrow::Cow, net::SocketAddr, sync::Arc, time::Duration};

use postbox_common::{Signal, context, error::SessionError, internal, outgoing, status::Status, tracing};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State, connection::Connection, rate_limit::RateLimiter, state,
    transaction_handler::SmtpTransactionHandler,
};

mod events;
mod io;
mod response;

#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

/// Protocol-side state of one connection.
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub state: State,
    /// Message content collected while reading DATA
    pub message: Vec<u8>,
    /// Whether the reply for the current state has been sent
    pub sent: bool,
}

pub type Response = (Option<Vec<String>>, Event);

/// Server-side timeouts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SmtpServerTimeouts {
    /// Waiting for a command
    pub command_secs: u64,
    /// Waiting for the next line of message content
    pub data_secs: u64,
    /// Maximum lifetime of a connection
    pub connection_secs: u64,
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: 300,
            data_secs: 180,
            connection_secs: 1800,
        }
    }
}

/// Per-session admission rules applied at MAIL FROM.
#[derive(Debug, Clone, Default)]
pub struct SessionPolicy {
    pub require_auth: bool,
    /// Accepted messages allowed per connection, 0 for no limit
    pub max_messages: usize,
    /// Applied to unauthenticated sessions only
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub banner: String,
    pub max_message_size: usize,
    pub timeouts: SmtpServerTimeouts,
    pub policy: SessionPolicy,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the host name used in the greeting and replies
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = banner.into();
        self
    }

    /// Set the SIZE limit, 0 for unlimited
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpServerTimeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    #[must_use]
    pub const fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.config.policy.require_auth = require_auth;
        self
    }

    #[must_use]
    pub const fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.config.policy.max_messages = max_messages;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.config.policy.rate_limiter = limiter;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    pub(super) context: Context,
    pub(super) banner: Arc<str>,
    pub(super) connection: Connection<Stream>,
    pub(super) handler: Box<dyn SmtpTransactionHandler>,
    pub(super) policy: SessionPolicy,
    /// SIZE limit (RFC 1870), enforced against the declared size at MAIL
    /// FROM and against the bytes actually received during DATA. 0 means
    /// unlimited.
    pub(super) max_message_size: usize,
    timeouts: SmtpServerTimeouts,
    start_time: std::time::Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        handler: Box<dyn SmtpTransactionHandler>,
        config: SessionConfig,
    ) -> Self {
        Self {
            peer,
            connection: Connection::new(stream),
            context: Context::default(),
            banner: if config.banner.is_empty() {
                std::env::var("HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string())
                    .into()
            } else {
                config.banner.into()
            },
            handler,
            policy: config.policy,
            max_message_size: config.max_message_size,
            timeouts: config.timeouts,
            start_time: std::time::Instant::now(),
        }
    }

    const fn timeout_secs(&self) -> u64 {
        match &self.context.state {
            State::Reading(_) => self.timeouts.data_secs,
            _ => self.timeouts.command_secs,
        }
    }

    fn business_context(&self) -> context::Context {
        context::Context {
            banner: Arc::clone(&self.banner),
            max_message_size: self.max_message_size,
            ..Default::default()
        }
    }

    /// Drive the connection until the client quits, the connection drops or
    /// the server shuts down.
    pub async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected to {}", self.peer);

        let mut validate_context = self.business_context();

        let result = loop {
            if self.start_time.elapsed() >= Duration::from_secs(self.timeouts.connection_secs) {
                tracing::warn!(
                    peer = ?self.peer,
                    max_secs = self.timeouts.connection_secs,
                    "Connection exceeded maximum lifetime, closing"
                );
                break Err(SessionError::Timeout(self.timeouts.connection_secs));
            }

            let (response, ev) = self.response(&mut validate_context).await;

            validate_context.response = None;
            self.context.sent = true;

            if let Err(err) = self.send_all(response.unwrap_or_default()).await {
                break Err(err);
            }

            if Event::ConnectionClose == ev {
                break Ok(());
            }

            match self
                .handle_command_loop(&mut validate_context, &mut signal)
                .await
            {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(err) => break Err(err),
            }
        };

        internal!("Connection to {} closed", self.peer);
        result
    }

    async fn send_all(&mut self, lines: Vec<String>) -> Result<(), SessionError> {
        for line in lines {
            outgoing!("{line}");

            self.connection.send(&line).await.map_err(|err| {
                internal!(level = ERROR, "{err}");
                SessionError::Protocol(format!("Failed to send response: {err}"))
            })?;
        }

        Ok(())
    }

    /// Wait for the next line, the shutdown signal or a timeout.
    ///
    /// Returns `Ok(true)` once the client has gone away.
    async fn handle_command_loop(
        &mut self,
        validate_context: &mut context::Context,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<bool, SessionError> {
        let timeout_secs = self.timeout_secs();

        tokio::select! {
            _ = signal.recv() => {
                self.close_with(
                    validate_context,
                    Cow::Owned(format!("4.3.2 {} Server shutting down", self.banner)),
                );
                Ok(false)
            }
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), self.receive(validate_context)) => {
                result.unwrap_or_else(|_| {
                    tracing::warn!(
                        peer = ?self.peer,
                        state = ?self.context.state,
                        timeout_secs,
                        "Client connection timed out"
                    );
                    self.close_with(
                        validate_context,
                        Cow::Owned(format!("4.4.2 {} Timeout, closing connection", self.banner)),
                    );
                    Ok(false)
                })
            }
        }
    }

    /// Queue a 421 reply and move to [`State::Close`].
    fn close_with(&mut self, validate_context: &mut context::Context, message: Cow<'static, str>) {
        self.context = Context {
            state: State::Close(state::Close),
            message: Vec::new(),
            sent: false,
        };
        validate_context.respond(Status::Unavailable, message);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use postbox_common::{Signal, context::Context, status::Status};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::{Session, SessionConfig, SmtpServerTimeouts};
    use crate::{
        State,
        rate_limit::{RateLimitConfig, RateLimiter},
        state,
        transaction_handler::{AcceptAllHandler, SmtpTransactionHandler},
    };

    /// Accepts mail for `good@` recipients and the single credential pair
    /// `user@x.me` / `secret`.
    #[derive(Default)]
    struct Recorder {
        messages: std::sync::Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl SmtpTransactionHandler for Recorder {
        async fn validate_connect(&mut self, _ctx: &mut Context) -> bool {
            true
        }

        async fn validate_ehlo(&mut self, _ctx: &mut Context) -> bool {
            true
        }

        async fn authenticate(&mut self, ctx: &mut Context, username: &str, password: &str) -> bool {
            if username == "user@x.me" && password == "secret" {
                ctx.authenticated = Some(username.to_string());
                true
            } else {
                false
            }
        }

        async fn validate_mail_from(&mut self, _ctx: &mut Context) -> bool {
            true
        }

        async fn validate_rcpt_to(&mut self, ctx: &mut Context) -> bool {
            let valid = ctx
                .envelope
                .recipients()
                .last()
                .is_some_and(|rcpt| rcpt.local_part() == "good");
            if !valid {
                ctx.respond(Status::Error, "5.1.1 Mailbox does not exist");
            }
            valid
        }

        async fn handle_message(&mut self, ctx: &mut Context) -> bool {
            if let Some(data) = &ctx.data {
                self.messages.lock().push(data.to_vec());
            }
            true
        }
    }

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("Timed out waiting for reply")
                .unwrap();
            line.trim_end().to_string()
        }

        /// Read a possibly multi-line reply, returning its last line
        async fn reply(&mut self) -> String {
            loop {
                let line = self.line().await;
                if line.len() < 4 || line.as_bytes()[3] != b'-' {
                    return line;
                }
            }
        }

        async fn send(&mut self, line: &str) -> String {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
            self.reply().await
        }
    }

    fn start(
        handler: Box<dyn SmtpTransactionHandler>,
        config: SessionConfig,
    ) -> (
        Client,
        tokio::task::JoinHandle<Result<(), postbox_common::error::SessionError>>,
        tokio::sync::broadcast::Sender<Signal>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (shutdown, receiver) = tokio::sync::broadcast::channel(1);
        let session = Session::create(server, "127.0.0.1:2525".parse().unwrap(), handler, config);
        let handle = tokio::spawn(session.run(receiver));

        let (reader, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(reader),
                writer,
            },
            handle,
            shutdown,
        )
    }

    fn config() -> SessionConfig {
        SessionConfig::builder()
            .with_banner("mx.authoritative.tld")
            .with_max_message_size(1024)
            .build()
    }

    #[tokio::test]
    async fn greeting_and_ehlo() {
        let (mut client, _handle, _shutdown) = start(Box::new(AcceptAllHandler), config());

        assert_eq!(client.line().await, "220 mx.authoritative.tld ESMTP Service ready");

        client
            .writer
            .write_all(b"EHLO client.example\r\n")
            .await
            .unwrap();
        let mut lines = Vec::new();
        loop {
            let line = client.line().await;
            let last = line.as_bytes()[3] == b' ';
            lines.push(line);
            if last {
                break;
            }
        }

        assert_eq!(lines[0], "250-mx.authoritative.tld greets client.example");
        assert!(lines.contains(&"250-AUTH PLAIN LOGIN".to_string()));
        assert!(lines.contains(&"250-SIZE 1024".to_string()));
        assert!(lines.iter().all(|line| !line.contains("STARTTLS")));

        assert!(client.send("STARTTLS").await.starts_with("502 5.5.1"));
        assert!(client.send("QUIT").await.starts_with("221"));
    }

    #[tokio::test]
    async fn full_transaction_with_dot_unstuffing() {
        let recorder = Recorder::default();
        let messages = recorder.messages.clone();
        let (mut client, handle, _shutdown) = start(Box::new(recorder), config());

        client.line().await;
        client.send("HELO client.example").await;
        assert!(client.send("MAIL FROM:<Ext@External.com>").await.starts_with("250 2.1.0"));
        assert!(client.send("RCPT TO:<good@authoritative.tld>").await.starts_with("250 2.1.5"));
        assert!(client.send("DATA").await.starts_with("354"));
        client
            .writer
            .write_all(b"Subject: hi\r\n\r\n..leading dot\r\nbody\r\n")
            .await
            .unwrap();
        assert!(client.send(".").await.starts_with("250"));
        assert!(client.send("QUIT").await.starts_with("221"));

        assert!(handle.await.unwrap().is_ok());
        let messages = messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n".to_vec());
    }

    #[tokio::test]
    async fn rejected_recipient_keeps_session() {
        let (mut client, _handle, _shutdown) = start(Box::new(Recorder::default()), config());

        client.line().await;
        client.send("EHLO client.example").await;
        client.send("MAIL FROM:<a@x.me>").await;
        assert_eq!(
            client.send("RCPT TO:<missing@authoritative.tld>").await,
            "550 5.1.1 Mailbox does not exist"
        );
        // No recipient accepted yet
        assert!(client.send("DATA").await.starts_with("503"));
        assert!(client.send("RCPT TO:<good@authoritative.tld>").await.starts_with("250"));
        assert!(client.send("DATA").await.starts_with("354"));
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let (mut client, handle, _shutdown) = start(Box::new(Recorder::default()), config());

        client.line().await;
        client.send("EHLO client.example").await;
        client.send("MAIL FROM:<a@x.me>").await;
        client.send("RCPT TO:<good@authoritative.tld>").await;
        client.send("DATA").await;

        let body = format!("{}\r\n", "x".repeat(100)).repeat(20);
        client.writer.write_all(body.as_bytes()).await.unwrap();

        assert!(client.reply().await.starts_with("552"));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn auth_required_before_mail() {
        let (mut client, _handle, _shutdown) = start(
            Box::new(Recorder::default()),
            SessionConfig::builder().with_require_auth(true).build(),
        );

        client.line().await;
        client.send("EHLO client.example").await;
        assert_eq!(
            client.send("MAIL FROM:<a@x.me>").await,
            "530 5.7.0 Authentication required"
        );

        let bad = STANDARD.encode("\0user@x.me\0wrong");
        assert_eq!(
            client.send(&format!("AUTH PLAIN {bad}")).await,
            "535 5.7.8 Authentication credentials invalid"
        );

        // LOGIN with challenges
        assert_eq!(client.send("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(client.send(&STANDARD.encode("user@x.me")).await, "334 UGFzc3dvcmQ6");
        assert!(client.send(&STANDARD.encode("secret")).await.starts_with("235"));

        assert!(client.send("AUTH LOGIN").await.starts_with("503"));
        assert!(client.send("MAIL FROM:<a@x.me>").await.starts_with("250"));
    }

    #[tokio::test]
    async fn message_cap_closes_connection() {
        let (mut client, handle, _shutdown) = start(
            Box::new(Recorder::default()),
            SessionConfig::builder().with_max_messages(1).build(),
        );

        client.line().await;
        client.send("EHLO client.example").await;
        client.send("MAIL FROM:<a@x.me>").await;
        client.send("RCPT TO:<good@authoritative.tld>").await;
        client.send("DATA").await;
        client.writer.write_all(b"Subject: one\r\n\r\nx\r\n").await.unwrap();
        assert!(client.send(".").await.starts_with("250"));

        assert_eq!(
            client.send("MAIL FROM:<a@x.me>").await,
            "421 4.7.0 Too many messages, please reconnect"
        );
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unauthenticated_rate_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            messages: 1,
            per_secs: 60,
        });
        let (mut client, _handle, _shutdown) = start(
            Box::new(Recorder::default()),
            SessionConfig::builder()
                .with_rate_limiter(Some(std::sync::Arc::new(limiter)))
                .build(),
        );

        client.line().await;
        client.send("EHLO client.example").await;
        assert!(client.send("MAIL FROM:<a@x.me>").await.starts_with("250"));
        client.send("RSET").await;
        assert_eq!(
            client.send("MAIL FROM:<a@x.me>").await,
            "450 4.7.1 Rate limit exceeded"
        );
        assert!(client.send("MAIL FROM:<b@x.me>").await.starts_with("250"));
    }

    #[tokio::test]
    async fn shutdown_signal_closes_session() {
        let (mut client, handle, shutdown) = start(Box::new(AcceptAllHandler), config());

        client.line().await;
        shutdown.send(Signal::Shutdown).unwrap();

        assert!(client.reply().await.starts_with("421 4.3.2"));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_client_times_out() {
        let (mut client, handle, _shutdown) = start(
            Box::new(AcceptAllHandler),
            SessionConfig::builder()
                .with_timeouts(SmtpServerTimeouts {
                    command_secs: 1,
                    ..SmtpServerTimeouts::default()
                })
                .build(),
        );

        client.line().await;
        assert!(client.reply().await.starts_with("421 4.4.2"));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn response_for_connect_state() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut session = Session::create(
            server,
            "[::]:25".parse().unwrap(),
            Box::new(AcceptAllHandler),
            config(),
        );
        let mut context = session.business_context();

        let (lines, _) = session.response(&mut context).await;
        assert_eq!(
            lines.unwrap(),
            vec![format!("{} mx.authoritative.tld ESMTP Service ready", Status::ServiceReady)]
        );

        session.context.sent = false;
        session.context.state = State::Quit(state::Quit);
        let (lines, event) = session.response(&mut context).await;
        assert!(lines.unwrap()[0].starts_with("221"));
        assert_eq!(event, super::Event::ConnectionClose);
    }
}
