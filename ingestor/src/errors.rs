use crate::decode::DecodeError;
use std::fmt;
use thiserror::Error;

/// Which of the two persistence backends an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    History,
    LatestValue,
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Store::History => f.write_str("history"),
            Store::LatestValue => f.write_str("latest-value"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("{store} store unavailable: {reason}")]
    StoreUnavailable { store: Store, reason: String },

    #[error("latest value not found for device: {0}")]
    NotFound(String),

    #[error("device ID is required")]
    EmptyDeviceId,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    pub fn history_unavailable(reason: impl fmt::Display) -> Self {
        Error::StoreUnavailable {
            store: Store::History,
            reason: reason.to_string(),
        }
    }

    pub fn latest_unavailable(reason: impl fmt::Display) -> Self {
        Error::StoreUnavailable {
            store: Store::LatestValue,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
