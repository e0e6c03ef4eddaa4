use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerSession, SharedBroker};
use crate::error::{EngineError, StoreError};
use crate::models::{
    BrokerConfig, BrokerConfigPatch, BrokerStatus, Scraper, ScraperEdit, ScraperId, ScraperProps,
};
use crate::persistence::{load_snapshot, Mutation, PersistenceCoordinator, BROKER_KEY, SCRAPERS_KEY};
use crate::pipeline::{ExecutionOutcome, ExecutionPipeline};
use crate::ports::{BrokerClient, BrokerEvent, FileWatchService, KeyValueStore, Notifier, VersionReader};
use crate::registry::{ScraperRegistry, SharedRegistry};
use crate::watch::{Registration, WatchEvent, WatchSupervisor};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub save_debounce: Duration,
    pub initial_scan: bool,
    /// Used when no broker record has been persisted yet.
    pub default_broker: BrokerConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(1000),
            initial_scan: true,
            default_broker: BrokerConfig::default(),
        }
    }
}

/// The collaborators an [`Engine`] drives.
pub struct Collaborators {
    pub watcher: Arc<dyn FileWatchService>,
    pub reader: Arc<dyn VersionReader>,
    pub client: Arc<dyn BrokerClient>,
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Scraper orchestration engine: registry, broker session, watches, pipeline and persistence,
/// wired together and exposed as the operator API.
pub struct Engine {
    settings: EngineSettings,
    registry: SharedRegistry,
    broker: SharedBroker,
    supervisor: Arc<WatchSupervisor>,
    pipeline: Arc<ExecutionPipeline>,
    persistence: Arc<PersistenceCoordinator>,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    watch_events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(settings: EngineSettings, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            watcher,
            reader,
            client,
            store,
            notifier,
        } = collaborators;

        let registry = ScraperRegistry::new().into_shared();
        let broker = BrokerSession::new(settings.default_broker.clone(), client.clone()).into_shared();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(WatchSupervisor::new(
            watcher,
            notifier.clone(),
            registry.clone(),
            events_tx,
        ));
        let pipeline = Arc::new(ExecutionPipeline::new(
            reader,
            client,
            registry.clone(),
            broker.clone(),
        ));
        let persistence = PersistenceCoordinator::new(
            store.clone(),
            notifier.clone(),
            registry.clone(),
            broker.clone(),
            supervisor.clone(),
            settings.save_debounce,
        );

        Arc::new(Self {
            settings,
            registry,
            broker,
            supervisor,
            pipeline,
            persistence,
            store,
            notifier,
            watch_events: std::sync::Mutex::new(Some(events_rx)),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Loads persisted state, starts the event tasks, connects the broker and arms a watch for
    /// every enabled scraper.
    pub async fn start(self: &Arc<Self>, broker_events: mpsc::Receiver<BrokerEvent>) {
        self.load().await;

        let forwarder = self.spawn_broker_forwarder(broker_events);
        let dispatcher = self.take_watch_events().map(|rx| self.spawn_dispatcher(rx));
        self.track(forwarder);
        if let Some(dispatcher) = dispatcher {
            self.track(dispatcher);
        }

        self.broker.lock().await.connect();

        let enabled = self.enabled_ids().await;
        let registrations =
            futures::future::join_all(enabled.iter().map(|id| self.supervisor.register(*id))).await;
        if registrations.contains(&Registration::Failed) {
            self.persistence.schedule_save();
        }
        info!(
            "Engine started with {} active watches.",
            self.supervisor.active_count().await
        );

        if self.settings.initial_scan {
            for id in self.enabled_ids().await {
                self.spawn_execution(id);
            }
        }
    }

    /// Cancels every subscription and writes pending settings immediately.
    pub async fn shutdown(&self) {
        info!("Shutting down scraper engine...");
        self.supervisor.unregister_all().await;
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
        self.persistence.flush_pending().await;
    }

    pub async fn add_scraper(&self, props: ScraperProps) -> ScraperId {
        let enabled = props.enabled;
        let id = self.registry.lock().await.add(props);
        info!("New scraper added: {}", id);
        self.persistence.observe(Mutation::ScraperAdded { id, enabled });
        id
    }

    /// Tears down the watch, then removes the scraper. Unknown ids are a no-op.
    pub async fn remove_scraper(&self, id: ScraperId) -> Option<Scraper> {
        let removed = self.supervisor.retire(id).await?;
        info!("Scraper '{}' ({}) removed.", removed.name, id);
        self.persistence.observe(Mutation::ScraperRemoved { id });
        Some(removed)
    }

    /// Returns the new `enabled` value. The watch follows asynchronously.
    pub async fn toggle_enabled(&self, id: ScraperId) -> Result<bool, EngineError> {
        let enabled = self
            .registry
            .lock()
            .await
            .toggle_enabled(id)
            .ok_or(EngineError::NotFound(id))?;
        self.persistence
            .observe(Mutation::ScraperToggled { id, enabled });
        Ok(enabled)
    }

    pub async fn edit_scraper(&self, id: ScraperId, edit: ScraperEdit) -> Result<(), EngineError> {
        let outcome = self
            .registry
            .lock()
            .await
            .edit(id, edit)
            .ok_or(EngineError::NotFound(id))?;
        if outcome.changed {
            self.persistence.observe(Mutation::ScraperEdited {
                id,
                watch_relevant: outcome.watch_relevant,
                enabled: outcome.enabled,
            });
        }
        Ok(())
    }

    pub async fn list_scrapers(&self) -> Vec<Scraper> {
        self.registry.lock().await.list().to_vec()
    }

    pub async fn find_scraper(&self, id: ScraperId) -> Result<Scraper, EngineError> {
        self.registry
            .lock()
            .await
            .find(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn broker_config(&self) -> BrokerConfig {
        self.broker.lock().await.config().clone()
    }

    pub async fn broker_status(&self) -> BrokerStatus {
        self.broker.lock().await.status().clone()
    }

    pub async fn update_broker_config(&self, patch: BrokerConfigPatch) {
        let change = self.broker.lock().await.update_config(patch);
        if change.changed {
            self.persistence.observe(Mutation::BrokerConfig(change));
        }
    }

    pub async fn toggle_broker_protocol(&self) {
        let change = self.broker.lock().await.toggle_protocol();
        self.persistence.observe(Mutation::BrokerConfig(change));
    }

    pub async fn connect_broker(&self) {
        self.broker.lock().await.connect();
    }

    pub async fn is_watching(&self, id: ScraperId) -> bool {
        self.supervisor.is_watching(id).await
    }

    /// Each record falls back to its defaults on its own.
    async fn load(&self) {
        let snapshot = load_snapshot(self.store.as_ref());

        match snapshot.scrapers {
            Ok(scrapers) => {
                let scrapers = scrapers.unwrap_or_default();
                info!("Loaded {} scrapers from settings.", scrapers.len());
                *self.registry.lock().await = ScraperRegistry::from_scrapers(scrapers);
            }
            Err(e) => self.warn_load_failure(SCRAPERS_KEY, &e),
        }

        match snapshot.broker {
            Ok(Some(config)) => self.broker.lock().await.replace_config(config),
            Ok(None) => debug!("No stored broker settings, using defaults."),
            Err(e) => self.warn_load_failure(BROKER_KEY, &e),
        }
    }

    fn warn_load_failure(&self, key: &str, error: &StoreError) {
        warn!("Could not load '{}', starting with defaults: {}", key, error);
        self.notifier.warn(&format!(
            "Stored settings '{}' could not be loaded: {}",
            key, error
        ));
    }

    async fn enabled_ids(&self) -> Vec<ScraperId> {
        self.registry
            .lock()
            .await
            .list()
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id)
            .collect()
    }

    fn take_watch_events(&self) -> Option<mpsc::UnboundedReceiver<WatchEvent>> {
        match self.watch_events.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }

    fn spawn_broker_forwarder(&self, mut events: mpsc::Receiver<BrokerEvent>) -> JoinHandle<()> {
        let broker = self.broker.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                broker.lock().await.on_event(event);
            }
            debug!("Broker event stream closed.");
        })
    }

    /// One pipeline run per change event, no coalescing.
    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !this
                    .supervisor
                    .is_current(event.scraper_id, event.generation)
                    .await
                {
                    debug!("Dropping {:?} from a cancelled watch.", event);
                    continue;
                }
                debug!("File change {:?} for scraper {}.", event.kind, event.scraper_id);
                this.spawn_execution(event.scraper_id);
            }
        })
    }

    fn spawn_execution(self: &Arc<Self>, id: ScraperId) {
        let pipeline = self.pipeline.clone();
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            match pipeline.run(id).await {
                None | Some(ExecutionOutcome::Superseded) => {}
                Some(_) => persistence.observe(Mutation::ScraperStatus { id }),
            }
        });
    }
}
