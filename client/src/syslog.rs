//! Local syslog ingestion feeding the log stream.
//!
//! Accepts RFC 5424 datagrams:
//! `<PRI>VERSION TIMESTAMP HOSTNAME APP-NAME PROCID MSGID STRUCTURED-DATA [MSG]`.

use chrono::DateTime;
use edgelink_common::{message::LogEntry, queue::OutboundQueue};
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 64 * 1024;

/// Stands in for a missing `<PRI>` so the rest of the header still parses
const PLACEHOLDER_PRI: &str = "<13>";

#[derive(Debug, Error)]
pub enum SyslogError {
    #[error("empty syslog message")]
    Empty,

    #[error("malformed syslog message: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses one RFC 5424 message.
///
/// A message without `<PRI>` gets [`LogEntry::UNKNOWN_SEVERITY`]. Nil (`-`)
/// app names become empty, a nil timestamp becomes `None`.
pub fn parse_rfc5424(line: &str) -> Result<LogEntry, SyslogError> {
    let line = line.trim_end_matches(['\n', '\r', '\0']);
    if line.trim().is_empty() {
        return Err(SyslogError::Empty);
    }

    let has_priority = line.starts_with('<');
    let parsed = if has_priority {
        syslog_rfc5424::parse_message(line)
    } else {
        syslog_rfc5424::parse_message(format!("{PLACEHOLDER_PRI}{line}"))
    };
    let message = parsed.map_err(|e| SyslogError::Parse(e.to_string()))?;

    let severity = if has_priority {
        message.severity as i32
    } else {
        LogEntry::UNKNOWN_SEVERITY
    };
    let nanos = message
        .timestamp_nanos
        .and_then(|nanos| u32::try_from(nanos).ok())
        .unwrap_or(0);
    let timestamp = message
        .timestamp
        .and_then(|secs| DateTime::from_timestamp(secs, nanos));
    let text: &str = &message.msg;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    Ok(LogEntry {
        severity,
        app_name: message.appname.unwrap_or_default(),
        text: text.to_string(),
        timestamp,
    })
}

/// UDP syslog receiver
pub struct SyslogListener {
    socket: UdpSocket,
}

impl SyslogListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, SyslogError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, SyslogError> {
        Ok(self.socket.local_addr()?)
    }

    /// Parses datagrams into `queue` until `cancel` fires or the queue
    /// closes. Malformed datagrams are logged and skipped.
    pub async fn run(self, queue: OutboundQueue<LogEntry>, cancel: CancellationToken) -> Result<(), SyslogError> {
        tracing::info!(address = ?self.socket.local_addr().ok(), "syslog listener started");
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, source) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => received?,
            };

            let datagram = String::from_utf8_lossy(&buf[..len]);
            let entry = match parse_rfc5424(&datagram) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(%source, error = %e, "dropping malformed syslog message");
                    continue;
                }
            };
            tracing::debug!(%source, digest = %entry, "syslog message");

            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                pushed = queue.push(entry) => pushed,
            };
            if pushed.is_err() {
                tracing::debug!("log queue closed, stopping syslog listener");
                return Ok(());
            }
        }
    }
}
