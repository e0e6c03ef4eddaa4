use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::{BrokerConfig, BrokerConfigPatch, BrokerStatus};
use crate::ports::{BrokerClient, BrokerEvent};

pub type SharedBroker = Arc<Mutex<BrokerSession>>;

/// Result of merging a [`BrokerConfigPatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigChange {
    pub changed: bool,
    pub reconnect: bool,
}

/// Owns the broker configuration and the observed connection status.
pub struct BrokerSession {
    config: BrokerConfig,
    status: BrokerStatus,
    client: Arc<dyn BrokerClient>,
}

impl BrokerSession {
    pub fn new(config: BrokerConfig, client: Arc<dyn BrokerClient>) -> Self {
        Self {
            config,
            status: BrokerStatus::default(),
            client,
        }
    }

    pub fn into_shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn status(&self) -> &BrokerStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.connected
    }

    /// Fire-and-forget; the result is reported back through [`BrokerSession::on_event`].
    pub fn connect(&self) {
        info!(
            "Connecting to MQTT broker {}:{} as '{}'.",
            self.config.host, self.config.port, self.config.client_id
        );
        self.client.connect(&self.config);
    }

    /// Merges the patch. `reconnect` is set when a connection-relevant field changed:
    /// client id, host, port, protocol, username or password.
    pub fn update_config(&mut self, patch: BrokerConfigPatch) -> ConfigChange {
        let mut change = ConfigChange::default();
        let config = &mut self.config;

        merge(&mut config.client_id, patch.client_id, &mut change, true);
        merge(&mut config.host, patch.host, &mut change, true);
        merge(&mut config.port, patch.port, &mut change, true);
        merge(&mut config.protocol, patch.protocol, &mut change, true);
        merge(&mut config.username, patch.username, &mut change, true);
        merge(&mut config.password, patch.password, &mut change, true);
        merge(&mut config.device_id, patch.device_id, &mut change, false);
        merge(&mut config.device_group, patch.device_group, &mut change, false);

        change
    }

    /// Swaps in a whole record, e.g. the persisted one at startup. Does not connect.
    pub fn replace_config(&mut self, config: BrokerConfig) {
        self.config = config;
    }

    /// Flips plaintext and TLS. Reported as a reconnect-relevant change.
    pub fn toggle_protocol(&mut self) -> ConfigChange {
        let next = self.config.protocol.toggled();
        self.update_config(BrokerConfigPatch {
            protocol: Some(next),
            ..BrokerConfigPatch::default()
        })
    }

    pub fn on_connection_event(&mut self, connected: bool) {
        self.status.connected = connected;
    }

    pub fn on_status_event(&mut self, description: String) {
        self.status.description = description;
    }

    pub fn on_event(&mut self, event: BrokerEvent) {
        debug!("Broker event: {:?}", event);
        match event {
            BrokerEvent::Connected(connected) => self.on_connection_event(connected),
            BrokerEvent::Status(description) => self.on_status_event(description),
        }
    }
}

fn merge<T: PartialEq>(field: &mut T, value: Option<T>, change: &mut ConfigChange, relevant: bool) {
    if let Some(value) = value {
        if *field != value {
            *field = value;
            change.changed = true;
            change.reconnect |= relevant;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::models::MqttProtocol;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingClient {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl BrokerClient for CountingClient {
        fn connect(&self, _config: &BrokerConfig) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        async fn publish(&self, _topic: &str, _payload: String) -> Result<(), PublishError> {
            Ok(())
        }
    }

    fn session() -> (BrokerSession, Arc<CountingClient>) {
        let client = Arc::new(CountingClient::default());
        (BrokerSession::new(BrokerConfig::default(), client.clone()), client)
    }

    #[test]
    fn host_change_requires_reconnect() {
        let (mut session, _) = session();
        let change = session.update_config(BrokerConfigPatch {
            host: Some("broker.example".to_string()),
            ..BrokerConfigPatch::default()
        });
        assert_eq!(change, ConfigChange { changed: true, reconnect: true });
        assert_eq!(session.config().host, "broker.example");
    }

    #[test]
    fn unchanged_values_and_device_fields_do_not_reconnect() {
        let (mut session, _) = session();
        let same = session.update_config(BrokerConfigPatch {
            port: Some(1883),
            ..BrokerConfigPatch::default()
        });
        assert!(!same.changed);

        let device = session.update_config(BrokerConfigPatch {
            device_id: Some("FC_9999".to_string()),
            ..BrokerConfigPatch::default()
        });
        assert_eq!(device, ConfigChange { changed: true, reconnect: false });
    }

    #[test]
    fn protocol_toggle_is_reconnect_relevant() {
        let (mut session, client) = session();
        let change = session.toggle_protocol();
        assert!(change.reconnect);
        assert_eq!(session.config().protocol, MqttProtocol::Tls);
        // merging never connects by itself
        assert_eq!(client.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_only_changes_through_events() {
        let (mut session, _) = session();
        assert!(!session.is_connected());
        session.on_event(BrokerEvent::Connected(true));
        session.on_event(BrokerEvent::Status("Connected".to_string()));
        assert!(session.is_connected());
        assert_eq!(session.status().description, "Connected");
    }
}
