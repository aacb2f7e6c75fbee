use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One issuance of a command through one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuationAttempt {
    /// Round number, starting at 1
    pub round: u32,
    pub channel: String,
    /// Wall-clock time the command was issued, whole seconds
    pub command_at: NaiveDateTime,
    pub matched: bool,
    /// Receipt time of the accepted confirmation record
    pub record_at: Option<NaiveDateTime>,
    /// `record_at - command_at` in seconds
    pub delta_secs: Option<i64>,
    /// Transport failure that prevented the command; distinct from a miss
    pub error: Option<String>,
}

/// Matched count for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTally {
    pub channel: String,
    pub matched: u32,
    pub total: u32,
}

/// Outcome of a confirmation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuationReport {
    pub rounds: u32,
    /// Per-channel tallies in channel order
    pub channels: Vec<ChannelTally>,
    pub attempts: Vec<ActuationAttempt>,
}

impl ActuationReport {
    /// Tally for a channel by name
    pub fn tally(&self, channel: &str) -> Option<&ChannelTally> {
        self.channels.iter().find(|t| t.channel == channel)
    }

    /// `api: 2/3, relay: 3/3, key: 1/3`
    pub fn summary(&self) -> String {
        self.channels
            .iter()
            .map(|t| format!("{}: {}/{}", t.channel, t.matched, t.total))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Every channel confirmed every round
    pub fn all_confirmed(&self) -> bool {
        self.channels.iter().all(|t| t.matched == t.total)
    }
}

/// Result type for confirmation runs
pub type ActuationResult<T> = Result<T, ActuationError>;

/// Fatal errors: nothing could be issued at all
#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),

    #[error("no actuation channels configured")]
    NoChannels,

    #[error("invalid confirmation pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Transport failure of a single channel issuance
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("MQTT publish failed: {0}")]
    Mqtt(String),

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
}
