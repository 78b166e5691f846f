#![allow(clippy::result_large_err)]
use crate::command::{Command, SessionTimeouts};
use crate::response::{parse_response_line, Response, ResponseBuilder};
use crate::tls::TlsOptions;
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("Error {error} connecting to {host}:{port}")]
    ConnectError {
        host: String,
        port: u16,
        error: String,
    },
    #[error("Timed Out connecting to {host}:{port} after {duration:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Error {error} reading response to {command:?}")]
    ReadError {
        command: Option<Command>,
        error: String,
        partial: String,
    },
    #[error("Error {error} flushing send buffer")]
    FlushError { error: String },
    #[error("Error {error} writing {command:?}")]
    WriteError { command: Command, error: String },
    #[error("TLS handshake with {host} failed: {error}")]
    TlsHandshake { host: String, error: String },
}

impl SessionError {
    /// True when the failure was a deadline expiring rather than the
    /// peer actively misbehaving. The verifier stops retrying a host
    /// once it times out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::TimeOutResponse { .. } | Self::TimeOutRequest { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

/// One live SMTP conversation on one socket.
///
/// The session tracks whether it is still healthy enough to be returned
/// to a pool: any transport-level error takes the socket away and the
/// session reports itself as unpoolable from then on.
#[derive(Debug)]
pub struct SmtpSession {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    port: u16,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SessionTimeouts,
    secure: bool,
    last_used: Instant,
    pool_key: Option<String>,
}

impl SmtpSession {
    pub async fn connect(
        host: &str,
        port: u16,
        timeouts: SessionTimeouts,
    ) -> Result<Self, SessionError> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SessionError::ConnectTimeout {
                host: host.to_string(),
                port,
                duration: timeouts.connect_timeout,
            })?
            .map_err(|err| SessionError::ConnectError {
                host: host.to_string(),
                port,
                error: format!("{err:#}"),
            })?;
        // No need for Nagle with SMTP request/response
        stream
            .set_nodelay(true)
            .map_err(|err| SessionError::ConnectError {
                host: host.to_string(),
                port,
                error: format!("{err:#}"),
            })?;
        Ok(Self::with_stream(stream, host, port, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        host: &str,
        port: u16,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            socket: Some(Box::new(stream)),
            hostname: host.to_string(),
            port,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
            secure: false,
            last_used: Instant::now(),
            pool_key: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn capabilities(&self) -> &HashMap<String, EsmtpCapability> {
        &self.capabilities
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(&name.to_ascii_uppercase())
    }

    pub fn timeouts(&self) -> &SessionTimeouts {
        &self.timeouts
    }

    /// The pool tag assigned at checkout time; None for ephemeral
    /// sessions that bypass the pool.
    pub fn pool_key(&self) -> Option<&str> {
        self.pool_key.as_deref()
    }

    pub fn set_pool_key(&mut self, key: String) {
        self.pool_key = Some(key);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn stamp_used(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn close(&mut self) {
        self.socket.take();
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, SessionError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(SessionError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(SessionError::ReadError {
                            command: cmd.cloned(),
                            error: format!("{err:#}"),
                            partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(SessionError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        });
                    }
                },
                None => {
                    return Err(SessionError::ReadError {
                        command: cmd.cloned(),
                        error: "the socket was closed in response to an earlier issue".to_string(),
                        partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                    });
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(SessionError::ReadError {
                    command: cmd.cloned(),
                    error: "Connection closed by peer".to_string(),
                    partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, SessionError> {
        if let Some(sock) = self.socket.as_mut() {
            if let Err(err) = sock.flush().await {
                self.socket.take();
                return Err(SessionError::FlushError {
                    error: format!("{err:#}"),
                });
            }
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed =
            parse_response_line(&line).map_err(SessionError::MalformedResponseLine)?;
        let mut response_builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line).map_err(SessionError::MalformedResponseLine)?;
            response_builder
                .add_line(&parsed)
                .map_err(SessionError::MalformedResponseLine)?;
        }

        let response = response_builder.build(command.map(|cmd| cmd.encode()));

        tracing::trace!("{}: {response:?}", self.hostname);

        Ok(response)
    }

    /// Read the 220 greeting that the server volunteers after connect.
    pub async fn read_banner(&mut self) -> Result<Response, SessionError> {
        self.read_response(None, self.timeouts.read_timeout).await
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, SessionError> {
        self.write_command_request(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    async fn write_command_request(&mut self, command: &Command) -> Result<(), SessionError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);

        let timeout_duration = command.client_timeout_request(&self.timeouts);
        match self.socket.as_mut() {
            Some(socket) => match timeout(timeout_duration, socket.write_all(line.as_bytes()))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(SessionError::WriteError {
                        command: command.clone(),
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    self.socket.take();
                    Err(SessionError::TimeOutRequest {
                        command: command.clone(),
                        duration: timeout_duration,
                    })
                }
            },
            None => Err(SessionError::WriteError {
                command: command.clone(),
                error: "the socket was closed in response to an earlier issue".to_string(),
            }),
        }
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, SessionError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        if response.code != 250 {
            return Err(SessionError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    /// Upgrade the session to TLS, then clear the capability set: the
    /// caller must EHLO again and the post-upgrade answer replaces it.
    pub async fn starttls(&mut self, options: &TlsOptions) -> Result<(), SessionError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(SessionError::Rejected(resp));
        }

        let connector = options.build_tls_connector();
        let server_name = match IpAddr::from_str(self.hostname.as_str()) {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(self.hostname.clone())
                .map_err(|_| SessionError::InvalidDnsName(self.hostname.clone()))?,
        };

        let stream = match self.socket.take() {
            Some(s) => s,
            None => return Err(SessionError::NotConnected),
        };

        match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(tls_stream)) => {
                self.socket.replace(Box::new(tls_stream));
                self.secure = true;
                self.capabilities.clear();
                Ok(())
            }
            Ok(Err(err)) => Err(SessionError::TlsHandshake {
                host: self.hostname.clone(),
                error: format!("{err:#}"),
            }),
            Err(_) => Err(SessionError::TlsHandshake {
                host: self.hostname.clone(),
                error: format!(
                    "handshake timed out after {:?}",
                    self.timeouts.starttls_timeout
                ),
            }),
        }
    }

    /// Health-check round trip used by the pool before reusing an idle
    /// session.
    pub async fn noop(&mut self) -> Result<Response, SessionError> {
        self.send_command(&Command::Noop).await
    }

    pub async fn rset(&mut self) -> Result<Response, SessionError> {
        self.send_command(&Command::Rset).await
    }

    /// Best-effort QUIT followed by close; errors are irrelevant since
    /// the socket is going away either way.
    pub async fn quit(&mut self) {
        self.send_command(&Command::Quit).await.ok();
        self.close();
    }
}
