use std::io;
use std::str::Utf8Error;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Errors reported by a [`crate::transport::Transport`].
///
/// This type is `Clone` so that a single connection failure can be handed to every operation
/// waiting on the connection.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { source: Arc<btleplug::Error> },

    #[error("The peripheral is not connected")]
    NotConnected,

    #[error("No peripheral matching the configured selector was found")]
    PeripheralNotFound,

    #[error("Connecting requires a running tokio runtime")]
    NoRuntime,

    #[error("Characteristic {characteristic} exists in more than one service, its notifications cannot be told apart")]
    AmbiguousNotifications { characteristic: uuid::Uuid },

    #[error("{0}")]
    Other(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(source: btleplug::Error) -> Self {
        TransportError::Btle { source: Arc::new(source) }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Read and subscribe requests must have an empty payload")]
    NonEmptyRequest,

    #[error("The device returned a characteristic without a value")]
    EmptyResponse,

    #[error("Characteristic {characteristic} was not found in service {service}")]
    CharacteristicNotFound { service: String, characteristic: String },

    #[error("The device was disconnected before the operation completed")]
    Disconnected,

    #[error("Invalid bluetooth identifier {identifier:?}: {source}")]
    InvalidIdentifier { identifier: String, source: uuid::Error },

    #[error("Characteristic {characteristic} does not support {operation}")]
    UnsupportedOperation { operation: &'static str, characteristic: String },

    #[error("Transport failure: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to load configuration: {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to initialize logging: {source}")]
    Logging { #[from] source: fern::InitError },

    #[error("Failed to open transport: {source}")]
    Transport { #[from] source: TransportError },

    #[error("Request failed: {source}")]
    Driver { #[from] source: DriverError },

    #[error("Invalid hex payload: {0}")]
    InvalidPayload(String),

    #[error("Request did not complete within {}", humantime::format_duration(*.0))]
    Timeout(Duration),
}
