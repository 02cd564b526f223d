//! Scriptable stand-in for an upstream SMTP relay.
#![allow(dead_code)]
//!
//! Records every command it receives, including decoded AUTH credentials
//! and the message body, so tests can check what the relay client sent.
//!
//! ```rust,no_run
//! # async fn example() -> std::io::Result<()> {
//! let server = MockRelay::builder().fail_auth().build().await?;
//! // point a RelayConfig at server.addr()
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Auth {
        mechanism: String,
        username: String,
        password: String,
    },
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Body after DATA, dot-unstuffed, without the final `.` line
    MessageContent(Vec<u8>),
    Quit,
    StartTls,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Script {
    capabilities: Vec<String>,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data_end: Reply,
    /// Never answer the greeting
    silent: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: vec![
                "mock.relay".to_string(),
                "SIZE 10485760".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
            auth: Reply::new(235, "2.7.0 Authentication successful"),
            mail_from: Reply::new(250, "2.1.0 OK"),
            rcpt_to: Reply::new(250, "2.1.5 OK"),
            data_end: Reply::new(250, "2.0.0 OK: queued"),
            silent: false,
        }
    }
}

pub struct MockRelay {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
}

impl MockRelay {
    #[must_use]
    pub fn builder() -> MockRelayBuilder {
        MockRelayBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Bodies of every message accepted or rejected after DATA
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        if script.silent {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Ok(());
        }

        writer
            .write_all(&Reply::new(220, "mock.relay ESMTP").to_bytes())
            .await?;

        loop {
            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let command_line = line.trim_end().to_string();
            let (verb, rest) = command_line
                .split_once(' ')
                .unwrap_or((command_line.as_str(), ""));

            let (reply, recorded) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => {
                    let mut reply = String::new();
                    let last = script.capabilities.len() - 1;
                    for (i, capability) in script.capabilities.iter().enumerate() {
                        let separator = if i == last { ' ' } else { '-' };
                        reply.push_str(&format!("250{separator}{capability}\r\n"));
                    }
                    (reply.into_bytes(), SmtpCommand::Ehlo(rest.to_string()))
                }
                "AUTH" => {
                    let (mechanism, initial) =
                        rest.split_once(' ').unwrap_or((rest, ""));
                    let mechanism = mechanism.to_ascii_uppercase();

                    let (username, password) = if mechanism == "LOGIN" {
                        writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                        let username = read_decoded(&mut reader).await?;
                        writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                        let password = read_decoded(&mut reader).await?;
                        (username, password)
                    } else {
                        let decoded = decode(initial);
                        let mut parts = decoded.split('\0').skip(1);
                        (
                            parts.next().unwrap_or_default().to_string(),
                            parts.next().unwrap_or_default().to_string(),
                        )
                    };

                    (
                        script.auth.to_bytes(),
                        SmtpCommand::Auth {
                            mechanism,
                            username,
                            password,
                        },
                    )
                }
                "MAIL" => (
                    script.mail_from.to_bytes(),
                    SmtpCommand::MailFrom(rest.to_string()),
                ),
                "RCPT" => (
                    script.rcpt_to.to_bytes(),
                    SmtpCommand::RcptTo(rest.to_string()),
                ),
                "DATA" => {
                    commands.write().await.push(SmtpCommand::Data);
                    writer
                        .write_all(&Reply::new(354, "End data with <CR><LF>.<CR><LF>").to_bytes())
                        .await?;

                    let content = read_body(&mut reader).await?;
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::MessageContent(content));
                    writer.write_all(&script.data_end.to_bytes()).await?;
                    continue;
                }
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    return Ok(());
                }
                "STARTTLS" => (
                    Reply::new(502, "5.5.1 Not implemented").to_bytes(),
                    SmtpCommand::StartTls,
                ),
                _ => (
                    Reply::new(500, "5.5.2 Unknown command").to_bytes(),
                    SmtpCommand::Other(command_line.clone()),
                ),
            };

            commands.write().await.push(recorded);
            writer.write_all(&reply).await?;
            writer.flush().await?;
        }
    }
}

fn decode(encoded: &str) -> String {
    STANDARD
        .decode(encoded.trim())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

async fn read_decoded<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(decode(&line))
}

async fn read_body<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut content = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line == b".\r\n" || line == b".\n" {
            break;
        }
        let unstuffed = if line.starts_with(b"..") {
            &line[1..]
        } else {
            &line[..]
        };
        content.extend_from_slice(unstuffed);
    }

    Ok(content)
}

pub struct MockRelayBuilder {
    script: Script,
}

impl MockRelayBuilder {
    /// Answer AUTH with `535`
    #[must_use]
    pub fn fail_auth(mut self) -> Self {
        self.script.auth = Reply::new(535, "5.7.8 Authentication credentials invalid");
        self
    }

    /// Answer the end of DATA with `code`
    #[must_use]
    pub fn reject_data(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn reject_rcpt(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    /// Offer only these AUTH mechanisms
    #[must_use]
    pub fn auth_mechanisms(mut self, mechanisms: &str) -> Self {
        self.script
            .capabilities
            .retain(|capability| !capability.starts_with("AUTH"));
        self.script.capabilities.push(format!("AUTH {mechanisms}"));
        self
    }

    /// Accept connections but never send a greeting
    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.script.silent = true;
        self
    }

    pub async fn build(self) -> std::io::Result<MockRelay> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_commands = Arc::clone(&commands);
        let accept_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            while !accept_shutdown.load(Ordering::Relaxed) {
                let Ok(Ok((stream, _))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                let script = Arc::clone(&script);
                let commands = Arc::clone(&accept_commands);
                tokio::spawn(async move {
                    if let Err(e) = MockRelay::handle_client(stream, script, commands).await {
                        tracing::debug!("Mock relay client error: {e}");
                    }
                });
            }
        });

        Ok(MockRelay {
            addr,
            commands,
            shutdown,
        })
    }
}
