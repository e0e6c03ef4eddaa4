use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::{ConfigChange, SharedBroker};
use crate::error::StoreError;
use crate::models::{BrokerConfig, Scraper, ScraperId};
use crate::ports::{KeyValueStore, Notifier};
use crate::registry::SharedRegistry;
use crate::watch::{Registration, WatchSupervisor};

pub const SCRAPERS_KEY: &str = "settings-file-scrapers";
pub const BROKER_KEY: &str = "settings-file-mqtt-broker";

/// A registry or broker-config mutation, reported explicitly by whoever performed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    ScraperAdded { id: ScraperId, enabled: bool },
    ScraperRemoved { id: ScraperId },
    ScraperToggled { id: ScraperId, enabled: bool },
    ScraperEdited { id: ScraperId, watch_relevant: bool, enabled: bool },
    /// Runtime status changed (pipeline result, forced disable). Saved, nothing else.
    ScraperStatus { id: ScraperId },
    BrokerConfig(ConfigChange),
}

/// Debounced whole-state snapshots, plus the reconnect/renew reactions mutations call for.
///
/// Each operator mutation resets one shared timer; the save fires once the window passes
/// without further operator mutations and writes the state current at that moment. Status
/// updates only arm the timer when none is pending, so a busy file cannot postpone a save.
pub struct PersistenceCoordinator {
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    registry: SharedRegistry,
    broker: SharedBroker,
    supervisor: Arc<WatchSupervisor>,
    delay: Duration,
    pending: StdMutex<PendingSave>,
}

#[derive(Default)]
struct PendingSave {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Both persisted records, decoded independently so one bad record does not hide the other.
#[derive(Debug)]
pub struct Snapshot {
    pub scrapers: Result<Option<Vec<Scraper>>, StoreError>,
    pub broker: Result<Option<BrokerConfig>, StoreError>,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
        registry: SharedRegistry,
        broker: SharedBroker,
        supervisor: Arc<WatchSupervisor>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            notifier,
            registry,
            broker,
            supervisor,
            delay,
            pending: StdMutex::new(PendingSave::default()),
        })
    }

    pub fn observe(self: &Arc<Self>, mutation: Mutation) {
        debug!("Observed mutation: {:?}", mutation);
        match mutation {
            Mutation::ScraperAdded { id, enabled: true } => self.spawn_reconcile(id, false),
            Mutation::ScraperToggled { id, enabled } => self.spawn_reconcile(id, enabled),
            Mutation::ScraperEdited {
                id,
                watch_relevant: true,
                enabled: true,
            } => self.spawn_reconcile(id, true),
            Mutation::BrokerConfig(ConfigChange { reconnect: true, .. }) => {
                let broker = self.broker.clone();
                tokio::spawn(async move {
                    broker.lock().await.connect();
                });
            }
            _ => {}
        }
        match mutation {
            Mutation::ScraperStatus { .. } => self.arm_save(false),
            _ => self.schedule_save(),
        }
    }

    /// Resets the debounce timer.
    pub fn schedule_save(self: &Arc<Self>) {
        self.arm_save(true);
    }

    /// Cancels any pending timer and saves immediately.
    pub async fn flush_pending(&self) {
        let previous = self.lock_pending().timer.take();
        if let Some(previous) = previous {
            previous.abort();
        }
        self.save_now().await;
    }

    /// Starts the timer. Without `reset` an already pending timer is left to fire as planned.
    fn arm_save(self: &Arc<Self>, reset: bool) {
        let mut pending = self.lock_pending();
        if !reset && pending.timer.is_some() {
            return;
        }

        pending.generation += 1;
        let generation = pending.generation;
        let this = self.clone();
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Leave the slot before saving so later mutations arm a fresh timer.
            {
                let mut pending = this.lock_pending();
                if pending.generation == generation {
                    pending.timer = None;
                }
            }
            this.save_now().await;
        });

        if let Some(previous) = pending.timer.replace(task) {
            previous.abort();
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingSave> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn save_now(&self) {
        let scrapers: Vec<Scraper> = self.registry.lock().await.list().to_vec();
        let broker: BrokerConfig = self.broker.lock().await.config().clone();

        // No await points below: an aborted timer never leaves a half-written snapshot.
        match self.write_snapshot(&scrapers, &broker) {
            Ok(()) => info!("Saved {} scrapers and broker settings.", scrapers.len()),
            Err(e) => {
                error!("Could not persist settings: {}", e);
                self.notifier
                    .warn(&format!("Settings could not be saved: {}", e));
            }
        }
    }

    fn write_snapshot(&self, scrapers: &[Scraper], broker: &BrokerConfig) -> Result<(), StoreError> {
        self.store.set(SCRAPERS_KEY, serde_json::to_value(scrapers)?)?;
        self.store.set(BROKER_KEY, serde_json::to_value(broker)?)?;
        self.store.flush()
    }

    fn spawn_reconcile(self: &Arc<Self>, id: ScraperId, renew: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            if this.supervisor.reconcile(id, renew).await == Registration::Failed {
                // the scraper was forced disabled
                this.schedule_save();
            }
        });
    }
}

/// Reads both persisted records. Missing keys yield `Ok(None)`.
pub fn load_snapshot(store: &dyn KeyValueStore) -> Snapshot {
    Snapshot {
        scrapers: load_key(store, SCRAPERS_KEY),
        broker: load_key(store, BROKER_KEY),
    }
}

fn load_key<T: serde::de::DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    store.get(key)?.map(decode::<T>).transpose()
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}
