use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, Level};

use crate::config::Config;
use crate::db::SqliteStore;
use crate::engine::{Collaborators, Engine};
use crate::error::StoreError;
use crate::fs_watch::NotifyWatchService;
use crate::mqtt_service::MqttService;
use crate::ports::{BrokerEvent, LogNotifier};
use crate::version_reader::FileVersionReader;

const BROKER_EVENT_CAPACITY: usize = 64;

/// Initialize logging
pub fn start_logging(level: Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Open the settings store and wire the engine to the real collaborators.
pub fn build_engine(config: &Config) -> Result<(Arc<Engine>, mpsc::Receiver<BrokerEvent>), StoreError> {
    let store = SqliteStore::new(&config.store_path)?;
    store.initialize_db()?;
    info!("Settings store opened at '{}'.", config.store_path);

    let (broker_tx, broker_rx) = mpsc::channel(BROKER_EVENT_CAPACITY);
    let engine = Engine::new(
        config.engine_settings(),
        Collaborators {
            watcher: Arc::new(NotifyWatchService),
            reader: Arc::new(FileVersionReader),
            client: Arc::new(MqttService::new(broker_tx)),
            store: Arc::new(store),
            notifier: Arc::new(LogNotifier),
        },
    );
    Ok((engine, broker_rx))
}

/// Handle graceful shutdown
pub async fn handle_shutdown(engine: Arc<Engine>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Scraper service is shutting down...");
    }
    engine.shutdown().await;
}
