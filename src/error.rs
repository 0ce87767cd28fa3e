//! Error taxonomy shared by the store, the API client and the router

use std::time::Duration;
use thiserror::Error;

/// Every failure the extension core can produce.
///
/// None of these cross a message channel as-is: the router turns them into
/// a structured [`crate::router::Reply`] with `success: false`.
#[derive(Debug, Error)]
pub enum ChatEmError {
    /// The persistent backend refused a read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A value could not be encoded or decoded. `raw` keeps the stored text
    /// when decoding failed so a caller can recover it by hand.
    #[error("Serialization error for \"{key}\": {message}")]
    Serialization {
        key: String,
        message: String,
        raw: Option<String>,
    },

    /// The request never reached a server.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered outside of 2xx.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("unknown action")]
    UnknownAction(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid value: {0}")]
    Validation(String),

    /// The cross-context channel failed to deliver or answer.
    #[error("{0}")]
    Channel(String),
}

impl ChatEmError {
    pub fn serialization(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialization {
            key: key.into(),
            message: message.to_string(),
            raw: None,
        }
    }

    /// Short tag carried in error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Serialization { .. } => "serialization",
            Self::Network(_) => "network",
            Self::Api { .. } => "api",
            Self::Timeout(_) => "timeout",
            Self::UnknownAction(_) | Self::InvalidPayload(_) => "routing",
            Self::Validation(_) => "validation",
            Self::Channel(_) => "channel",
        }
    }

    /// An expired or rejected token shows up as a plain 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }
}

impl From<rusqlite::Error> for ChatEmError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ChatEmError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatEmError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage(format!("Storage task failed: {}", err))
    }
}
