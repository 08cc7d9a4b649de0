use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of the canary call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;

/// Heartbeat request, the name is free-form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Heartbeat reply, the message is free-form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

/// One forwarded log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Syslog severity, 0 (emergency) to 7 (debug). Anything else, including
    /// [`LogEntry::UNKNOWN_SEVERITY`], means the severity is unknown.
    pub severity:  i32,
    pub app_name:  String,
    pub text:      String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogEntry {
    /// Severity recorded when the source did not provide one
    pub const UNKNOWN_SEVERITY: i32 = 9;

    pub fn new(severity: i32, app_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            severity,
            app_name: app_name.into(),
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The severity if it is a valid syslog level
    pub fn known_severity(&self) -> Option<u8> {
        u8::try_from(self.severity).ok().filter(|level| *level <= 7)
    }
}

impl Default for LogEntry {
    fn default() -> Self {
        Self::new(Self::UNKNOWN_SEVERITY, "", "")
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp.map(|ts| ts.timestamp()).unwrap_or_default();
        write!(f, "{ts} ({}){}:{}", self.severity, self.app_name, self.text)
    }
}
