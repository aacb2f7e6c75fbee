//! Actuation confirmation: issue the door-open action over several channels
//! and count how many issuances the device's own log proves.

pub mod channel;
pub mod engine;
pub mod types;

pub use channel::{
    ActuationChannel, ChannelSet, MqttTriggerChannel, RestDoorChannel, default_channels,
};
pub use engine::{ConfirmationEngine, LogSource, correlate};
pub use types::{
    ActuationAttempt, ActuationError, ActuationReport, ActuationResult, ChannelError, ChannelTally,
};
