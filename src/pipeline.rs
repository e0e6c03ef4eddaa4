use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::broker::SharedBroker;
use crate::models::{
    publish_failure_state, read_failure_state, Scraper, ScraperId, STATE_BROKER_DISCONNECTED,
    STATE_SUCCESSFUL,
};
use crate::ports::{BrokerClient, VersionReader};
use crate::registry::SharedRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Published { version: String },
    BrokerDisconnected { version: String },
    ReadFailed,
    PublishFailed { version: String, reason: String },
    /// A run that started later finished reading first. Nothing was published or stored.
    Superseded,
}

impl ExecutionOutcome {
    fn update_state(&self, scraper: &Scraper) -> String {
        match self {
            ExecutionOutcome::Published { .. } => STATE_SUCCESSFUL.to_string(),
            ExecutionOutcome::BrokerDisconnected { .. } => STATE_BROKER_DISCONNECTED.to_string(),
            ExecutionOutcome::ReadFailed => read_failure_state(&scraper.path),
            ExecutionOutcome::PublishFailed { reason, .. } => publish_failure_state(reason),
            ExecutionOutcome::Superseded => scraper.update_state.clone(),
        }
    }

    fn version(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Published { version }
            | ExecutionOutcome::BrokerDisconnected { version }
            | ExecutionOutcome::PublishFailed { version, .. } => Some(version),
            ExecutionOutcome::ReadFailed | ExecutionOutcome::Superseded => None,
        }
    }
}

/// Read, decide, publish. No retries: the next change event is the retry.
///
/// Runs for one scraper may overlap. Each run takes a sequence number when it starts; once its
/// read returns, a run that is older than the newest completed read is dropped, so a slow read
/// never overwrites or republishes over a newer result.
pub struct ExecutionPipeline {
    reader: Arc<dyn VersionReader>,
    client: Arc<dyn BrokerClient>,
    registry: SharedRegistry,
    broker: SharedBroker,
    next_run: AtomicU64,
    latest_read: StdMutex<HashMap<ScraperId, u64>>,
}

impl ExecutionPipeline {
    pub fn new(
        reader: Arc<dyn VersionReader>,
        client: Arc<dyn BrokerClient>,
        registry: SharedRegistry,
        broker: SharedBroker,
    ) -> Self {
        Self {
            reader,
            client,
            registry,
            broker,
            next_run: AtomicU64::new(0),
            latest_read: StdMutex::new(HashMap::new()),
        }
    }

    /// Snapshots the scraper and broker status, then executes. Disabled or unknown scrapers
    /// are skipped.
    pub async fn run(&self, id: ScraperId) -> Option<ExecutionOutcome> {
        let scraper = {
            let registry = self.registry.lock().await;
            registry.find(id).filter(|s| s.enabled).cloned()
        }?;
        let connected = self.broker.lock().await.is_connected();
        Some(self.execute(&scraper, connected).await)
    }

    pub async fn execute(&self, scraper: &Scraper, broker_connected: bool) -> ExecutionOutcome {
        let run = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let started = OffsetDateTime::now_utc();

        let outcome = match self.reader.read_version(&scraper.path).await {
            _ if !self.claim(scraper.id, run) => ExecutionOutcome::Superseded,
            Err(e) => {
                warn!("Could not get file version of '{}': {}", scraper.path.display(), e);
                ExecutionOutcome::ReadFailed
            }
            Ok(version) if !broker_connected => {
                debug!("Broker disconnected, recording version {} locally.", version);
                ExecutionOutcome::BrokerDisconnected { version }
            }
            Ok(version) => self.publish(scraper, version, started).await,
        };

        if outcome == ExecutionOutcome::Superseded {
            debug!("Dropping stale run {} of scraper {}.", run, scraper.id);
            return outcome;
        }
        self.record(scraper, run, started, outcome).await
    }

    async fn publish(
        &self,
        scraper: &Scraper,
        version: String,
        timestamp: OffsetDateTime,
    ) -> ExecutionOutcome {
        let (device_id, device_group) = {
            let broker = self.broker.lock().await;
            let config = broker.config();
            (config.device_id.clone(), config.device_group.clone())
        };
        let timestamp = timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| timestamp.to_string());

        let payload = json!({
            "scraperId": scraper.id,
            "deviceId": device_id,
            "group": device_group,
            "timestamp": timestamp,
            "measures": {
                scraper.name.clone(): &version,
                format!("{}DataType", scraper.name): "String",
            },
        });

        match self.client.publish(&scraper.mqtt_topic, payload.to_string()).await {
            Ok(()) => {
                info!(
                    "Published version {} of '{}' to '{}'.",
                    version, scraper.name, scraper.mqtt_topic
                );
                ExecutionOutcome::Published { version }
            }
            Err(e) => {
                warn!("Could not publish to '{}': {}", scraper.mqtt_topic, e);
                ExecutionOutcome::PublishFailed {
                    version,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Writes the outcome back unless the scraper was removed or re-pointed meanwhile, or a
    /// newer run got there first.
    async fn record(
        &self,
        snapshot: &Scraper,
        run: u64,
        started: OffsetDateTime,
        outcome: ExecutionOutcome,
    ) -> ExecutionOutcome {
        let mut registry = self.registry.lock().await;
        let mut latest_read = self.lock_latest_read();
        let Some(entry) = registry.find_mut(snapshot.id) else {
            debug!("Scraper {} removed during execution, dropping result.", snapshot.id);
            latest_read.remove(&snapshot.id);
            return outcome;
        };
        if entry.path != snapshot.path {
            debug!("Path of scraper {} changed during execution, dropping result.", snapshot.id);
            return outcome;
        }
        if latest_read.get(&snapshot.id).is_some_and(|latest| *latest > run) {
            debug!("Dropping stale run {} of scraper {}.", run, snapshot.id);
            return ExecutionOutcome::Superseded;
        }

        entry.last_update_utc = Some(started);
        entry.update_state = outcome.update_state(snapshot);
        if let Some(version) = outcome.version() {
            entry.last_version = Some(version.to_string());
        }
        outcome
    }

    /// Marks `run` as the newest completed read for `id`. False when a newer read finished
    /// first.
    fn claim(&self, id: ScraperId, run: u64) -> bool {
        let mut latest_read = self.lock_latest_read();
        let latest = latest_read.entry(id).or_insert(run);
        if *latest > run {
            return false;
        }
        *latest = run;
        true
    }

    fn lock_latest_read(&self) -> MutexGuard<'_, HashMap<ScraperId, u64>> {
        match self.latest_read.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
