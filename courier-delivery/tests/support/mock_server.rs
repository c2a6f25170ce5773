//! Mock SMTP relay for exercising the lettre transport end to end
//!
//! The relay speaks just enough plaintext SMTP for a client session:
//! greeting, EHLO (advertising AUTH PLAIN LOGIN), AUTH, MAIL, RCPT, DATA and
//! QUIT. Every command is recorded, and each response can be overridden to
//! inject failures.
#![allow(dead_code)]

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA), without the terminating dot
    MessageContent(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct SmtpResponse {
    code: u16,
    message: String,
}

impl SmtpResponse {
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

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    capabilities: Vec<String>,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_end_response: SmtpResponse,
    /// Responses for the first sessions' end-of-data, before falling back to
    /// `data_end_response`
    data_end_script: Vec<SmtpResponse>,
}

impl MockServerConfig {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);

        for (i, capability) in self.capabilities.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "250{separator}{capability}\r\n");
        }

        response.into_bytes()
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Relay"),
            capabilities: vec![
                "localhost".to_string(),
                "SIZE 10000000".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
            auth_response: SmtpResponse::new(235, "Authentication successful"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            data_end_script: Vec::new(),
        }
    }
}

/// Mock SMTP relay bound to an ephemeral localhost port
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    sessions: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Number of sessions accepted so far
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        session: usize,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let command_line = line.trim();
            tracing::debug!("Mock relay received: {}", command_line);

            let (verb, argument) = command_line
                .split_once(' ')
                .unwrap_or((command_line, ""));

            let (response, command) = match verb.to_uppercase().as_str() {
                "EHLO" => (config.ehlo_bytes(), SmtpCommand::Ehlo(argument.to_string())),
                "AUTH" => (
                    config.auth_response.to_bytes(),
                    SmtpCommand::Auth(argument.to_string()),
                ),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument.to_string()),
                ),
                "RCPT" => (
                    config.rcpt_to_response.to_bytes(),
                    SmtpCommand::RcptTo(argument.to_string()),
                ),
                "DATA" => (
                    SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>").to_bytes(),
                    SmtpCommand::Data,
                ),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer
                        .write_all(&SmtpResponse::new(221, "Bye").to_bytes())
                        .await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(command_line.to_string()),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&response).await?;
            writer.flush().await?;

            if !is_data {
                continue;
            }

            let mut content = String::new();
            let mut data_line = String::new();
            loop {
                data_line.clear();
                if reader.read_line(&mut data_line).await? == 0 {
                    return Ok(());
                }

                if data_line.trim_end_matches(['\r', '\n']) == "." {
                    break;
                }
                content.push_str(&data_line);
            }

            commands
                .write()
                .await
                .push(SmtpCommand::MessageContent(content));

            let response = config
                .data_end_script
                .get(session)
                .unwrap_or(&config.data_end_response);
            writer.write_all(&response.to_bytes()).await?;
            writer.flush().await?;
        }
    }
}

/// Builder for [`MockSmtpServer`]
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// End-of-data response for the next session, in session order
    #[must_use]
    pub fn then_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config
            .data_end_script
            .push(SmtpResponse::new(code, message));
        self
    }

    /// Bind to an ephemeral port and start accepting sessions
    ///
    /// # Errors
    ///
    /// Returns an error if the listener can't bind
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = MockSmtpServer {
            addr,
            commands_received: Arc::clone(&commands),
            sessions: Arc::clone(&sessions),
            shutdown: Arc::clone(&shutdown),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                let Ok(Ok((stream, _peer))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                let session = sessions.fetch_add(1, Ordering::SeqCst);
                let config = Arc::clone(&config);
                let commands = Arc::clone(&commands);

                tokio::spawn(async move {
                    if let Err(e) =
                        MockSmtpServer::handle_client(stream, config, session, commands).await
                    {
                        tracing::debug!("Mock relay client error: {}", e);
                    }
                });
            }
        });

        Ok(server)
    }
}
