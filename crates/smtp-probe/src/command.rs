use std::time::Duration;

/// Deadlines for one probe session. Reads cover the span from command
/// write to final response line; NOOP gets a short leash because it is
/// only used for pool health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub starttls_timeout: Duration,
    pub noop_timeout: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
            starttls_timeout: Duration::from_secs(15),
            noop_timeout: Duration::from_secs(2),
        }
    }
}

impl SessionTimeouts {
    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(2);
        Self {
            connect_timeout: short,
            read_timeout: short,
            starttls_timeout: short,
            noop_timeout: short,
        }
    }
}

/// The complete verb set the probe is permitted to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    MailFrom { address: String },
    RcptTo { address: String },
    Rset,
    Quit,
    StartTls,
    Noop,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::MailFrom { address } => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo { address } => format!("RCPT TO:<{address}>\r\n"),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Noop => "NOOP\r\n".to_string(),
        }
    }

    /// Timeout for reading the response to this command
    pub fn client_timeout(&self, timeouts: &SessionTimeouts) -> Duration {
        match self {
            Self::StartTls => timeouts.starttls_timeout,
            Self::Noop => timeouts.noop_timeout,
            _ => timeouts.read_timeout,
        }
    }

    /// Timeout for writing the request
    pub fn client_timeout_request(&self, timeouts: &SessionTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
