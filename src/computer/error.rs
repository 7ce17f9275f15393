//! Transport error types

use std::time::Duration;

use thiserror::Error;

use crate::action::ValidationError;
use crate::config::ConfigError;

/// Errors from the computer channel
#[derive(Debug, Error)]
pub enum ComputerError {
    #[error("not connected to computer")]
    NotConnected,

    #[error("failed to connect to {endpoint}{}: {message}", status_suffix(.status))]
    Connect {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("timed out after {0:?} waiting for machine metadata")]
    HandshakeTimeout(Duration),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("channel closed{}: {reason}", code_suffix(.code))]
    ChannelClosed { code: Option<u16>, reason: String },

    #[error("inbound frame failed validation: {0}")]
    InvalidFrame(String),

    #[error("an exchange for tool '{0}' is already pending")]
    ExchangeInFlight(String),

    #[error("invalid endpoint request: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ComputerError {
    /// Whether the error means the channel itself is unusable
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ComputerError::NotConnected
                | ComputerError::Connect { .. }
                | ComputerError::ConnectTimeout { .. }
                | ComputerError::Channel(_)
                | ComputerError::ChannelClosed { .. }
                | ComputerError::InvalidUrl(_)
                | ComputerError::Config(_)
        )
    }

    /// Short label for the `kind` dimension of `vmpilot_execute_errors_total`
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ComputerError::NotConnected => "not_connected",
            ComputerError::Connect { .. } => "connect",
            ComputerError::ConnectTimeout { .. } => "connect_timeout",
            ComputerError::HandshakeTimeout(_) => "handshake_timeout",
            ComputerError::Channel(_) => "channel",
            ComputerError::ChannelClosed { .. } => "closed",
            ComputerError::InvalidFrame(_) => "invalid_frame",
            ComputerError::ExchangeInFlight(_) => "in_flight",
            ComputerError::InvalidUrl(_) => "invalid_url",
            ComputerError::Validation(_) => "validation",
            ComputerError::Serialization(_) => "serialization",
            ComputerError::Config(_) => "config",
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

fn code_suffix(code: &Option<u16>) -> String {
    code.map(|c| format!(" (code {})", c)).unwrap_or_default()
}
