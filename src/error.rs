use std::path::PathBuf;
use thiserror::Error;

use crate::models::ScraperId;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Could not watch path '{path}': {reason}")]
    Unwatchable { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum VersionReadError {
    #[error("Could not open file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not read version.")]
    NoVersion,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("MQTT client is not connected.")]
    NotConnected,
    #[error("Payload could not be encoded: {0}")]
    Encoding(String),
    #[error("Client rejected publish: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Stored value is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store connection lock poisoned.")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Scraper {0} not found.")]
    NotFound(ScraperId),
}
