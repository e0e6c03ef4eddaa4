use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::io::ErrorKind;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::ExponentialBackoff;

use crate::error::PublishError;
use crate::models::{BrokerConfig, MqttProtocol};
use crate::ports::{BrokerClient, BrokerEvent};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// The eventloop ends on these and the operator has to fix the settings.
const NEEDS_TLS: &str = "Needs SSL/TLS enabled";

struct Connection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// `rumqttc` implementation of [`BrokerClient`]. Each `connect` supersedes the previous
/// connection.
pub struct MqttService {
    connection: Mutex<Option<Connection>>,
    events: mpsc::Sender<BrokerEvent>,
}

impl MqttService {
    pub fn new(events: mpsc::Sender<BrokerEvent>) -> Self {
        Self {
            connection: Mutex::new(None),
            events,
        }
    }

    fn current_client(&self) -> Option<AsyncClient> {
        match self.connection.lock() {
            Ok(guard) => guard.as_ref().map(|c| c.client.clone()),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|c| c.client.clone()),
        }
    }
}

impl Drop for MqttService {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.lock() {
            if let Some(connection) = guard.take() {
                connection.event_loop.abort();
            }
        }
    }
}

pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_clean_session(true);

    if !config.username.is_empty() && !config.password.is_empty() {
        mqtt_options.set_credentials(&config.username, &config.password);
    }
    if config.protocol == MqttProtocol::Tls {
        // rustls with the platform's native roots
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }
    mqtt_options
}

#[async_trait]
impl BrokerClient for MqttService {
    fn connect(&self, config: &BrokerConfig) {
        debug!("Configuring MQTT broker at {}:{}...", config.host, config.port);

        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let event_loop = tokio::spawn(run_event_loop(eventloop, self.events.clone()));

        let mut guard = match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.replace(Connection { client, event_loop }) {
            info!("Update broker connection with new settings.");
            previous.event_loop.abort();
        }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        let client = self.current_client().ok_or(PublishError::NotConnected)?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| {
                error!("Failed to publish message to '{}': {:?}", topic, e);
                PublishError::Client(e.to_string())
            })
    }
}

/// What the event loop does after a connection error.
#[derive(Debug, PartialEq, Eq)]
enum ErrorAction {
    Pause(String),
    End(String),
}

fn classify_error(error: &ConnectionError) -> ErrorAction {
    match error {
        ConnectionError::MqttState(e) => ErrorAction::Pause(e.to_string()),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            ErrorAction::Pause("Timeout".to_string())
        }
        ConnectionError::Tls(e) => ErrorAction::End(e.to_string()),
        ConnectionError::Io(e) => classify_io(e),
        ConnectionError::ConnectionRefused(code) => ErrorAction::End(format!("{:?}", code)),
        ConnectionError::NotConnAck(packet) => {
            ErrorAction::End(format!("Unexpected packet {:?}", packet))
        }
        _ => ErrorAction::End("Connection Error".to_string()),
    }
}

fn classify_io(error: &std::io::Error) -> ErrorAction {
    // a plaintext client talking to a TLS listener
    if error.kind() == ErrorKind::InvalidData && error.to_string() == "Promised boundary crossed: 256" {
        ErrorAction::End(NEEDS_TLS.to_string())
    } else {
        ErrorAction::Pause(error.to_string())
    }
}

fn backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(500)
        .max_delay(MAX_BACKOFF)
}

async fn run_event_loop(mut eventloop: EventLoop, events: mpsc::Sender<BrokerEvent>) {
    let report = |connected: bool, status: String| {
        let events = events.clone();
        async move {
            let _ = events.send(BrokerEvent::Connected(connected)).await;
            let _ = events.send(BrokerEvent::Status(status)).await;
        }
    };

    let mut retry = backoff();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker.");
                retry = backoff();
                report(true, "Connected".to_string()).await;
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!("[MQTT] Topic: {}, Payload: {:?}", p.topic, p.payload);
            }
            Ok(Event::Incoming(Packet::PingResp)) | Ok(Event::Outgoing(_)) => {}
            Ok(event) => debug!("Unhandled event: {:?}", event),
            Err(e) => match classify_error(&e) {
                ErrorAction::Pause(status) => {
                    let delay = retry.next().unwrap_or(MAX_BACKOFF);
                    warn!("[MQTT] Pause eventloop task for {:?} due to: {}", delay, status);
                    report(false, status).await;
                    sleep(delay).await;
                }
                ErrorAction::End(status) => {
                    warn!("[MQTT] End eventloop task due to: {}", status);
                    report(false, status).await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_only_when_both_present() {
        let mut config = BrokerConfig {
            username: "admin".to_string(),
            ..BrokerConfig::default()
        };
        assert!(mqtt_options(&config).credentials().is_none());

        config.password = "secret".to_string();
        assert_eq!(
            mqtt_options(&config).credentials(),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn options_follow_config() {
        let config = BrokerConfig {
            client_id: "scraper-01".to_string(),
            host: "broker.local".to_string(),
            port: 8883,
            ..BrokerConfig::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(options.client_id(), "scraper-01");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
    }

    #[test]
    fn tls_mismatch_ends_the_loop() {
        let io = std::io::Error::new(ErrorKind::InvalidData, "Promised boundary crossed: 256");
        assert_eq!(classify_io(&io), ErrorAction::End(NEEDS_TLS.to_string()));

        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(classify_io(&refused), ErrorAction::Pause(_)));
    }

    #[test]
    fn backoff_is_capped() {
        let delays: Vec<_> = backoff().take(12).collect();
        assert_eq!(delays[0], Duration::from_millis(1000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), MAX_BACKOFF);
    }
}
