#![allow(dead_code)]

use async_trait::async_trait;
use scraper_flux::error::{PublishError, StoreError, VersionReadError, WatchError};
use scraper_flux::models::{BrokerConfig, ScraperProps};
use scraper_flux::ports::{
    BrokerClient, BrokerEvent, EventCallback, FileWatchService, FsEventKind, KeyValueStore,
    Notifier, Subscription, VersionReader,
};
use scraper_flux::{Collaborators, Engine, EngineSettings};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct WatchEntry {
    path: PathBuf,
    callback: Arc<EventCallback>,
    cancelled: bool,
}

#[derive(Default)]
pub struct FakeWatcher {
    entries: Mutex<Vec<WatchEntry>>,
    failing: Mutex<HashSet<PathBuf>>,
}

impl FakeWatcher {
    pub fn fail_on(&self, path: &str) {
        self.failing.lock().unwrap().insert(PathBuf::from(path));
    }

    pub fn created(&self, path: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.path == Path::new(path))
            .count()
    }

    pub fn cancelled(&self, path: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.path == Path::new(path) && e.cancelled)
            .count()
    }

    pub fn live(&self) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| !e.cancelled).count()
    }

    pub fn live_for(&self, path: &str) -> usize {
        self.created(path) - self.cancelled(path)
    }

    /// Delivers an event to every live subscription on `path`.
    pub fn fire(&self, path: &str, kind: FsEventKind) {
        let callbacks: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.path == Path::new(path) && !e.cancelled)
            .map(|e| e.callback.clone())
            .collect();
        for callback in callbacks {
            callback(kind);
        }
    }

    /// Delivers an event through the n-th subscription ever created, cancelled or not.
    pub fn fire_entry(&self, index: usize, kind: FsEventKind) {
        let callback = self.entries.lock().unwrap()[index].callback.clone();
        callback(kind);
    }
}

struct FakeSubscription {
    watcher: Arc<FakeWatcher>,
    index: usize,
}

impl Subscription for FakeSubscription {
    fn cancel(self: Box<Self>) {
        self.watcher.entries.lock().unwrap()[self.index].cancelled = true;
    }
}

pub struct SharedWatcher(pub Arc<FakeWatcher>);

impl FileWatchService for SharedWatcher {
    fn watch(
        &self,
        path: &Path,
        _recursive: bool,
        on_event: EventCallback,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        if self.0.failing.lock().unwrap().contains(path) {
            return Err(WatchError::Unwatchable {
                path: path.to_path_buf(),
                reason: "No such file or directory".to_string(),
            });
        }
        let mut entries = self.0.entries.lock().unwrap();
        entries.push(WatchEntry {
            path: path.to_path_buf(),
            callback: Arc::new(on_event),
            cancelled: false,
        });
        Ok(Box::new(FakeSubscription {
            watcher: self.0.clone(),
            index: entries.len() - 1,
        }))
    }
}

#[derive(Default)]
pub struct FakeReader {
    versions: Mutex<HashMap<PathBuf, String>>,
    queued: Mutex<HashMap<PathBuf, VecDeque<(Duration, String)>>>,
    calls: Mutex<usize>,
}

impl FakeReader {
    pub fn set(&self, path: &str, version: &str) {
        self.versions
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), version.to_string());
    }

    /// Queues one answer for `path` that arrives after `delay`. Queued answers are served
    /// first, in order.
    pub fn queue(&self, path: &str, delay: Duration, version: &str) {
        self.queued
            .lock()
            .unwrap()
            .entry(PathBuf::from(path))
            .or_default()
            .push_back((delay, version.to_string()));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl VersionReader for FakeReader {
    async fn read_version(&self, path: &Path) -> Result<String, VersionReadError> {
        *self.calls.lock().unwrap() += 1;
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(|answers| answers.pop_front());
        if let Some((delay, version)) = queued {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Ok(version);
        }
        self.versions
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(VersionReadError::NoVersion)
    }
}

#[derive(Default)]
pub struct FakeClient {
    pub connects: Mutex<Vec<BrokerConfig>>,
    pub published: Mutex<Vec<(String, Value)>>,
    pub fail_publish: Mutex<bool>,
}

impl FakeClient {
    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeClient {
    fn connect(&self, config: &BrokerConfig) {
        self.connects.lock().unwrap().push(config.clone());
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        if *self.fail_publish.lock().unwrap() {
            return Err(PublishError::Client("request channel closed".to_string()));
        }
        let payload: Value = serde_json::from_str(&payload).unwrap();
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
    pub writes: Mutex<Vec<(String, Value)>>,
    pub flushes: Mutex<usize>,
    pub fail_writes: Mutex<bool>,
    pub fail_reads: Mutex<bool>,
}

impl MemoryStore {
    pub fn seed(&self, key: &str, value: Value) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn writes_to(&self, key: &str) -> usize {
        self.writes.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock().unwrap()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if *self.fail_reads.lock().unwrap() {
            return Err(StoreError::Poisoned);
        }
        Ok(self.value(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if *self.fail_writes.lock().unwrap() {
            return Err(StoreError::Poisoned);
        }
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.clone()));
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub warnings: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }
}

pub const DEBOUNCE: Duration = Duration::from_millis(1000);

pub struct Harness {
    pub engine: Arc<Engine>,
    pub watcher: Arc<FakeWatcher>,
    pub reader: Arc<FakeReader>,
    pub client: Arc<FakeClient>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    broker_tx: mpsc::Sender<BrokerEvent>,
    broker_rx: Option<mpsc::Receiver<BrokerEvent>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::default(), false)
    }

    pub fn with_store(store: MemoryStore, initial_scan: bool) -> Self {
        let watcher = Arc::new(FakeWatcher::default());
        let reader = Arc::new(FakeReader::default());
        let client = Arc::new(FakeClient::default());
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::default());
        let (broker_tx, broker_rx) = mpsc::channel(16);

        let engine = Engine::new(
            EngineSettings {
                save_debounce: DEBOUNCE,
                initial_scan,
                default_broker: BrokerConfig::default(),
            },
            Collaborators {
                watcher: Arc::new(SharedWatcher(watcher.clone())),
                reader: reader.clone(),
                client: client.clone(),
                store: store.clone(),
                notifier: notifier.clone(),
            },
        );

        Self {
            engine,
            watcher,
            reader,
            client,
            store,
            notifier,
            broker_tx,
            broker_rx: Some(broker_rx),
        }
    }

    pub async fn start(&mut self) {
        let rx = self.broker_rx.take().expect("harness started twice");
        self.engine.start(rx).await;
        settle().await;
    }

    pub async fn broker_connected(&self, connected: bool) {
        self.broker_tx
            .send(BrokerEvent::Connected(connected))
            .await
            .unwrap();
        settle().await;
    }
}

pub fn props(name: &str, path: &str, topic: &str) -> ScraperProps {
    ScraperProps {
        name: name.to_string(),
        path: PathBuf::from(path),
        mqtt_topic: topic.to_string(),
        enabled: true,
    }
}

/// Lets spawned tasks on the current-thread runtime run to completion.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}
