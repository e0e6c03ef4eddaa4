use scraper_flux::config::Config;
use scraper_flux::service_utils::{build_engine, handle_shutdown, start_logging};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            start_logging(tracing::Level::INFO);
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    start_logging(config.log_level);

    let (engine, broker_events) = match build_engine(&config) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Failed to create settings store: {:?}", e);
            return;
        }
    };

    engine.start(broker_events).await;
    info!("Scraper service started.");

    handle_shutdown(engine).await;
    info!("All services shut down successfully.");
}
