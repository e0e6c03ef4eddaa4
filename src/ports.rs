//! Narrow interfaces to the collaborators the engine drives but does not own.

use async_trait::async_trait;
use std::path::Path;

use crate::error::{PublishError, StoreError, VersionReadError, WatchError};
use crate::models::BrokerConfig;

/// Kinds of change notifications delivered by a watch subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Write,
    Chmod,
    Remove,
    Rename,
    Rescan,
    Error,
    Access,
    Other,
}

impl FsEventKind {
    /// Whether an event of this kind should run the read-then-publish pipeline.
    pub fn triggers_execution(self) -> bool {
        !matches!(self, FsEventKind::Access | FsEventKind::Other)
    }
}

pub type EventCallback = Box<dyn Fn(FsEventKind) + Send + Sync + 'static>;

pub trait Subscription: Send {
    fn cancel(self: Box<Self>);
}

pub trait FileWatchService: Send + Sync {
    fn watch(
        &self,
        path: &Path,
        recursive: bool,
        on_event: EventCallback,
    ) -> Result<Box<dyn Subscription>, WatchError>;
}

#[async_trait]
pub trait VersionReader: Send + Sync {
    async fn read_version(&self, path: &Path) -> Result<String, VersionReadError>;
}

/// Connection-state notifications emitted asynchronously by a [`BrokerClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected(bool),
    Status(String),
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Starts (or replaces) the broker connection. The outcome arrives later as [`BrokerEvent`]s.
    fn connect(&self, config: &BrokerConfig);

    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError>;
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
    fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str);
}

/// Surfaces operator warnings through the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn warn(&self, message: &str) {
        tracing::warn!(target: "operator", "{}", message);
    }
}
