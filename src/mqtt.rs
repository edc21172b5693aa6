use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;

use crate::channels::{AlertRecord, RelayStore};
use crate::config;
use crate::dispatch::Registration;
use crate::error::{DispatchError, RelayError};

/// Relay store backed by an MQTT broker. Alert records are published
/// retained; whatever fans them out to contacts subscribes on the broker.
#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
    ack_timeout: Duration,
    connected: Arc<watch::Sender<bool>>,
    publishing: Arc<Mutex<()>>,
    published: broadcast::Sender<u16>,
    acks: broadcast::Sender<u16>,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"sosband-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path: config.topic_path.clone().unwrap_or("sosband".to_string()),
                ack_timeout: Duration::from_secs(config.ack_timeout_seconds.unwrap_or(10)),
                connected: Arc::new(watch::channel(false).0),
                publishing: Arc::new(Mutex::new(())),
                published: broadcast::channel(10).0,
                acks: broadcast::channel(10).0,
            },
            eventloop,
        )
    }

    /// Drive the connection. Must run for publishes to leave the process.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        self.connected.send_replace(true);
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Publish(pkid)) => {
                        debug!("Publish {} sent", pkid);
                        let _ = self.published.send(pkid);
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::PubAck(ack)) => {
                        debug!("Publish {} acknowledged", ack.pkid);
                        let _ = self.acks.send(ack.pkid);
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    self.connected.send_replace(false);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn alert_topic(topic_path: &str, sender_id: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}/alerts/{}/{}",
        topic_path,
        sanitize_name(sender_id),
        timestamp.timestamp_millis()
    )
}

#[async_trait]
impl RelayStore for MqttClient {
    async fn create_alert(&self, record: &AlertRecord) -> Result<String, RelayError> {
        let topic = alert_topic(&self.topic_path, &record.sender_id, record.timestamp);
        let payload = serde_json::to_vec(record)?;
        let deadline = Instant::now() + self.ack_timeout;
        let mut acks = self.acks.subscribe();

        // Publishes are serialized so the next packet id sent out is ours
        let pkid = {
            let _publishing = self.publishing.lock().await;
            let mut published = self.published.subscribe();
            info!("Publishing alert record to {}", topic);
            self.client
                .publish(topic.as_str(), QoS::AtLeastOnce, true, payload)
                .await?;
            tokio::time::timeout_at(deadline, next_id(&mut published, None)).await
        };
        let Ok(Some(pkid)) = pkid else {
            return Err(RelayError::AckTimeout(self.ack_timeout));
        };

        match tokio::time::timeout_at(deadline, next_id(&mut acks, Some(pkid))).await {
            Ok(Some(_)) => Ok(topic),
            _ => Err(RelayError::AckTimeout(self.ack_timeout)),
        }
    }
}

#[async_trait]
impl Registration for MqttClient {
    async fn ensure_ready(&self) -> Result<(), DispatchError> {
        let mut connected = self.connected.subscribe();
        let wait = async move {
            loop {
                let ready = *connected.borrow_and_update();
                if ready {
                    return true;
                }
                if connected.changed().await.is_err() {
                    return false;
                }
            }
        };
        match tokio::time::timeout(self.ack_timeout, wait).await {
            Ok(true) => Ok(()),
            _ => Err(DispatchError::Registration(
                "relay broker not connected".to_string(),
            )),
        }
    }
}

/// Next packet id on `ids`, or the next one equal to `wanted` when given.
async fn next_id(ids: &mut broadcast::Receiver<u16>, wanted: Option<u16>) -> Option<u16> {
    loop {
        match ids.recv().await {
            Ok(id) if wanted.is_none_or(|w| w == id) => return Some(id),
            Ok(id) => debug!("Ignoring acknowledgement for packet {}", id),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Missed {} packet ids", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn sanitize_name(name: &str) -> String {
    // Lowercase, with every non-alphanumeric character replaced by an underscore
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
