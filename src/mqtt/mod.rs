pub mod ha_interface;

use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MqttConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/* Keep alive goes on the wire as 16 bit seconds */
const MAX_KEEP_ALIVE: Duration = Duration::from_secs(u16::MAX as u64);

#[derive(Debug, Clone, PartialEq)]
pub enum MqttConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("MQTT client is not connected")]
    NotConnected,
    #[error("Timeout connecting to the MQTT broker")]
    ConnectTimeout,
    #[error("MQTT connection error: {0}")]
    Connection(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Publish/subscribe connection used to deliver entities.
#[async_trait]
pub trait MessageBus: Send {
    /// Stores the last will for the next connection. Never touches a session
    /// that is already established.
    async fn set_last_will(&mut self, topic: &str, payload: &str) -> Result<(), BusError>;
    /// Connects unless already connected, in which case nothing happens.
    async fn connect(&mut self) -> Result<(), BusError>;
    async fn disconnect(&mut self) -> Result<(), BusError>;
    async fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError>;
    fn status(&self) -> MqttConnectionStatus;
}

pub struct MqttBus {
    options: MqttOptions,
    client: Option<AsyncClient>,
    status: watch::Receiver<MqttConnectionStatus>,
    eventloop: Option<JoinHandle<()>>,
}

impl MqttBus {
    pub fn new(config: &MqttConfig, keep_alive: Duration) -> Self {
        info!("MQTT connection to {}:{} configured", config.host, config.port);
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        // The broker should notice a dead client within one cycle
        options.set_keep_alive(keep_alive.clamp(MIN_KEEP_ALIVE, MAX_KEEP_ALIVE));
        if let Some(user) = &config.user {
            options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }
        if config.tls {
            debug!("Enabling TLS for MQTT connection");
            options.set_transport(Transport::tls_with_default_config());
        }

        let (_, status) = watch::channel(MqttConnectionStatus::Disconnected);
        return MqttBus {
            options,
            client: None,
            status,
            eventloop: None,
        };
    }

    fn client(&self) -> Result<&AsyncClient, BusError> {
        if *self.status.borrow() != MqttConnectionStatus::Connected {
            return Err(BusError::NotConnected);
        }
        self.client.as_ref().ok_or(BusError::NotConnected)
    }

    fn stop_eventloop(&mut self) {
        if let Some(handle) = self.eventloop.take() {
            handle.abort();
        }
        self.client = None;
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn set_last_will(&mut self, topic: &str, payload: &str) -> Result<(), BusError> {
        if *self.status.borrow() == MqttConnectionStatus::Connected {
            debug!("MQTT client is connected, last will on '{topic}' applies from the next connection");
        }
        self.options.set_last_will(LastWill::new(topic, payload.as_bytes().to_vec(), QoS::AtLeastOnce, false));
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), BusError> {
        if *self.status.borrow() == MqttConnectionStatus::Connected {
            debug!("MQTT client is already connected, skipping subsequent attempt");
            return Ok(());
        }

        /* Anything left from a broken connection goes away */
        self.stop_eventloop();

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 10);
        let (tx, rx) = watch::channel(MqttConnectionStatus::Connecting);
        self.status = rx;

        self.eventloop = Some(tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        let _ = tx.send(MqttConnectionStatus::Connected);
                    },
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("Disconnected from MQTT broker");
                        let _ = tx.send(MqttConnectionStatus::Disconnected);
                        break;
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, dropping connection", e);
                        let _ = tx.send(MqttConnectionStatus::Error(e.to_string()));
                        break;
                    }
                }
            }
        }));
        self.client = Some(client);

        let mut status = self.status.clone();
        let outcome = tokio::time::timeout(CONNECT_TIMEOUT, async {
            status.wait_for(|s| *s != MqttConnectionStatus::Connecting).await.map(|s| s.clone())
        }).await;

        match outcome {
            Ok(Ok(MqttConnectionStatus::Connected)) => Ok(()),
            Ok(Ok(MqttConnectionStatus::Error(e))) => {
                self.stop_eventloop();
                Err(BusError::Connection(e))
            },
            Ok(_) => {
                self.stop_eventloop();
                Err(BusError::Connection("event loop ended before the connection was established".to_string()))
            },
            Err(_) => {
                self.stop_eventloop();
                Err(BusError::ConnectTimeout)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        let client = self.client()?.clone();
        client.disconnect().await?;

        /* Let the event loop flush pending publishes and the disconnect */
        if let Some(handle) = self.eventloop.take() {
            if tokio::time::timeout(CONNECT_TIMEOUT, handle).await.is_err() {
                error!("MQTT event loop did not finish after disconnect");
            }
        }
        self.client = None;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        let client = self.client()?;
        client.publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec()).await?;
        debug!("Published to '{topic}' (retain: {retain}): {payload}");
        Ok(())
    }

    fn status(&self) -> MqttConnectionStatus {
        self.status.borrow().clone()
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.stop_eventloop();
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// What a [`RecordingBus`] has been asked to do, in order.
    #[derive(Debug, Clone, PartialEq)]
    pub enum BusCall {
        SetLastWill { topic: String, payload: String },
        Connect,
        Disconnect,
        Publish { topic: String, payload: String, retain: bool },
    }

    /// In-memory bus for tests, can be told to fail publishes to some topics.
    #[derive(Default)]
    pub struct RecordingBus {
        pub calls: Vec<BusCall>,
        pub connected: bool,
        pub failing_topics: Vec<String>,
        pub fail_connect: bool,
    }

    impl RecordingBus {
        pub fn publishes(&self) -> Vec<(String, String, bool)> {
            self.calls.iter().filter_map(|c| match c {
                BusCall::Publish { topic, payload, retain } => Some((topic.clone(), payload.clone(), *retain)),
                _ => None,
            }).collect()
        }

        pub fn publishes_to(&self, topic: &str) -> Vec<String> {
            self.publishes().into_iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, p, _)| p)
                .collect()
        }

        pub fn connects(&self) -> usize {
            self.calls.iter().filter(|c| **c == BusCall::Connect).count()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn set_last_will(&mut self, topic: &str, payload: &str) -> Result<(), BusError> {
            self.calls.push(BusCall::SetLastWill { topic: topic.to_string(), payload: payload.to_string() });
            Ok(())
        }

        async fn connect(&mut self) -> Result<(), BusError> {
            if self.fail_connect {
                return Err(BusError::ConnectTimeout);
            }
            if !self.connected {
                self.calls.push(BusCall::Connect);
                self.connected = true;
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), BusError> {
            if !self.connected {
                return Err(BusError::NotConnected);
            }
            self.calls.push(BusCall::Disconnect);
            self.connected = false;
            Ok(())
        }

        async fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
            if !self.connected {
                return Err(BusError::NotConnected);
            }
            if self.failing_topics.iter().any(|t| t == topic) {
                return Err(BusError::Connection(format!("refused publish to {topic}")));
            }
            self.calls.push(BusCall::Publish { topic: topic.to_string(), payload: payload.to_string(), retain });
            Ok(())
        }

        fn status(&self) -> MqttConnectionStatus {
            if self.connected {
                MqttConnectionStatus::Connected
            } else {
                MqttConnectionStatus::Disconnected
            }
        }
    }

    fn mqtt_config(tls: bool) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: Some("user".to_string()),
            password: None,
            hass_discovery_prefix: "homeassistant".to_string(),
            tls,
            client_id: "energomera2mqtt-test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let mut bus = MqttBus::new(&mqtt_config(false), Duration::from_secs(30));
        assert_eq!(bus.status(), MqttConnectionStatus::Disconnected);
        assert!(matches!(bus.publish("a/b", "{}", false).await, Err(BusError::NotConnected)));
        assert!(matches!(bus.disconnect().await, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_last_will_stored_in_options() {
        let mut bus = MqttBus::new(&mqtt_config(false), Duration::from_secs(1));
        bus.set_last_will("homeassistant/binary_sensor/x/y/state", "{\"value\":\"OFF\"}").await.unwrap();

        let will = bus.options.last_will().unwrap();
        assert_eq!(will.topic, "homeassistant/binary_sensor/x/y/state");
        assert_eq!(&will.message[..], b"{\"value\":\"OFF\"}");
        assert_eq!(bus.options.keep_alive(), MIN_KEEP_ALIVE);
    }

    #[test]
    fn test_keep_alive_bounds() {
        let bus = MqttBus::new(&mqtt_config(false), Duration::from_secs(30));
        assert_eq!(bus.options.keep_alive(), Duration::from_secs(30));

        let bus = MqttBus::new(&mqtt_config(false), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(bus.options.keep_alive(), Duration::from_secs(65535));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        // Nothing listens on port 1
        let mut bus = MqttBus::new(&mqtt_config(false), Duration::from_secs(30));
        assert!(bus.connect().await.is_err());
        assert_ne!(bus.status(), MqttConnectionStatus::Connected);
        assert!(bus.client.is_none());
    }
}
