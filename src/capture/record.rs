//! Envelope parsing and the stored line format of captured records.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Receipt timestamp format at the head of every stored line
pub const RECEIPT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `<PRI>Mon DD HH:MM:SS host message`
static ENVELOPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<(\d{1,3})>([A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(\S+)\s+(.*)$")
        .expect("envelope pattern is valid")
});

static STORED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) \[([^\]]+)\] ",
        r"(?:PRI=(\d+) \(fac=\d+, sev=\d+\), time=(.+?), host=(\S+), msg=(.*)|RAW: (.*))$",
    ))
    .expect("stored line pattern is valid")
});

/// Parsed syslog-like envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub priority: u16,
    pub facility: u16,
    pub severity: u16,
    /// Timestamp as the device wrote it (`Mon DD HH:MM:SS`)
    pub timestamp: String,
    pub host: String,
    pub message: String,
}

impl Envelope {
    /// Match a payload against the envelope pattern
    pub fn parse(payload: &str) -> Option<Self> {
        let caps = ENVELOPE_RE.captures(payload)?;
        let priority: u16 = caps[1].parse().ok()?;
        Some(Self {
            priority,
            facility: priority >> 3,
            severity: priority & 7,
            timestamp: caps[2].to_string(),
            host: caps[3].to_string(),
            message: caps[4].to_string(),
        })
    }
}

/// One captured record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// `ip:port` the datagram came from
    pub source: String,
    /// Local wall-clock receipt time; `None` only for foreign lines in a stream
    pub received_at: Option<NaiveDateTime>,
    pub envelope: Option<Envelope>,
    /// Message body for envelopes, the verbatim payload otherwise
    pub message: String,
    /// The line as stored
    pub line: String,
}

impl LogRecord {
    /// Build a record for a freshly received payload
    pub fn from_payload(payload: &str, peer: SocketAddr, received_at: NaiveDateTime) -> Self {
        let envelope = Envelope::parse(payload);
        let message = envelope
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| payload.to_string());
        let mut record = Self {
            source: peer.to_string(),
            received_at: Some(received_at),
            envelope,
            message,
            line: String::new(),
        };
        record.line = record.format_line();
        record
    }

    /// Parse a stored line back into a record. Lines in an unknown shape are
    /// kept as raw records without a timestamp.
    pub fn from_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(caps) = STORED_RE.captures(line) else {
            return Self {
                source: String::new(),
                received_at: None,
                envelope: None,
                message: line.to_string(),
                line: line.to_string(),
            };
        };

        let received_at = NaiveDateTime::parse_from_str(&caps[1], RECEIPT_FORMAT).ok();
        let envelope = caps.get(3).and_then(|pri| {
            let priority: u16 = pri.as_str().parse().ok()?;
            Some(Envelope {
                priority,
                facility: priority >> 3,
                severity: priority & 7,
                timestamp: caps.get(4)?.as_str().to_string(),
                host: caps.get(5)?.as_str().to_string(),
                message: caps.get(6)?.as_str().to_string(),
            })
        });
        let message = match &envelope {
            Some(env) => env.message.clone(),
            None => caps
                .get(7)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        };

        Self {
            source: caps[2].to_string(),
            received_at,
            envelope,
            message,
            line: line.to_string(),
        }
    }

    /// Whether this record came in as a structured envelope
    pub fn is_structured(&self) -> bool {
        self.envelope.is_some()
    }

    fn format_line(&self) -> String {
        let received = self
            .received_at
            .map(|ts| ts.format(RECEIPT_FORMAT).to_string())
            .unwrap_or_default();
        match &self.envelope {
            Some(env) => format!(
                "{} [{}] PRI={} (fac={}, sev={}), time={}, host={}, msg={}",
                received,
                self.source,
                env.priority,
                env.facility,
                env.severity,
                env.timestamp,
                env.host,
                env.message
            ),
            None => format!("{} [{}] RAW: {}", received, self.source, self.message),
        }
    }
}
