//! MQTT broker adapter, implemented on `rumqttc`.
//!
//! Grounded on `local_tuya/mqtt/client.py`'s `MQTTClient` (topic layout,
//! last-will, birth message, reconnect-with-backoff), translated to
//! `rumqttc`'s split `AsyncClient`/`EventLoop`: unlike `aiomqtt`, `rumqttc`
//! requires its `EventLoop` to be polled continuously by the owner rather
//! than exposing an async iterator, so a background task drains it and
//! republishes `Incoming::Publish` packets onto an internal `mpsc` channel
//! that `take_commands` hands to the caller.

use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::value::{Value, Values};

#[derive(Clone)]
pub struct MqttConfig {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
    pub prefix: String,
    pub keepalive: std::time::Duration,
    pub backoff: Backoff,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("discovery_prefix", &self.discovery_prefix)
            .field("prefix", &self.prefix)
            .field("keepalive", &self.keepalive)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// A decoded inbound command: set `property` on `device_id` to `value`.
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    pub device_id: String,
    pub property: String,
    pub value: Value,
}

pub struct MqttAdapter {
    client: AsyncClient,
    prefix: String,
    discovery_prefix: String,
    poll_task: JoinHandle<()>,
}

impl MqttAdapter {
    /// Connects to the broker (last-will `offline` on
    /// `"{prefix}/status/driver"`), subscribes to every device's command
    /// topics, and starts the background poll task. Returns the adapter
    /// plus the channel `DeviceCommand`s arrive on.
    pub async fn connect(config: MqttConfig, cancel: CancellationToken) -> (Self, mpsc::Receiver<DeviceCommand>) {
        let driver_status_topic = format!("{}/status/driver", config.prefix);

        let mut options = MqttOptions::new(format!("tuya-bridge-{}", std::process::id()), config.hostname.clone(), config.port);
        options.set_keep_alive(config.keepalive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(driver_status_topic.as_str(), "offline", QoS::AtLeastOnce, true));

        let (client, event_loop) = AsyncClient::new(options, 64);

        let set_topic_filter = format!("{}/set/+/+", config.prefix);
        if let Err(err) = client.subscribe(&set_topic_filter, QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "initial MQTT subscribe failed, will retry once connected");
        }

        let (commands_tx, commands_rx) = mpsc::channel(256);
        let poll_task = tokio::spawn(poll_loop(
            event_loop,
            client.clone(),
            config.prefix.clone(),
            driver_status_topic,
            config.backoff.clone(),
            commands_tx,
            cancel,
        ));

        (
            Self {
                client,
                prefix: config.prefix,
                discovery_prefix: config.discovery_prefix,
                poll_task,
            },
            commands_rx,
        )
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn publish_state(&self, device_id: &str, values: &Values) -> Result<(), rumqttc::ClientError> {
        let topic = format!("{}/get/{device_id}", self.prefix);
        let payload = crate::value::values_to_json(values).to_string();
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await
    }

    pub async fn publish_availability(&self, device_id: &str, online: bool) -> Result<(), rumqttc::ClientError> {
        let topic = format!("{}/status/{device_id}", self.prefix);
        let payload = if online { "online" } else { "offline" };
        self.client.publish(topic, QoS::AtLeastOnce, true, payload).await
    }

    pub async fn publish_discovery(&self, topic: &str, payload: &Json) -> Result<(), rumqttc::ClientError> {
        self.client.publish(topic, QoS::AtLeastOnce, true, payload.to_string()).await
    }

    pub async fn close(self) {
        self.poll_task.abort();
        let _ = self.poll_task.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    mut event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    prefix: String,
    driver_status_topic: String,
    mut backoff: Backoff,
    commands_tx: mpsc::Sender<DeviceCommand>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = event_loop.poll() => next,
        };

        match next {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                backoff.reset();
                if let Err(err) = client.publish(driver_status_topic.as_str(), QoS::AtLeastOnce, true, "online").await {
                    tracing::warn!(error = %err, "failed to publish birth message");
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if let Some(command) = parse_command(&prefix, &publish.topic, &publish.payload) {
                    if commands_tx.send(command).await.is_err() {
                        return; // receiver dropped, nothing left to do
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "MQTT event loop error, backing off before retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = backoff.wait() => {}
                }
            }
        }
    }
}

/// Parse a `"{prefix}/set/{deviceId}/{property}"` publish into a
/// `DeviceCommand`. Per the boundary behaviors: an empty payload decodes to
/// nothing (no command is produced); a non-JSON payload decodes to its raw
/// string form rather than being rejected.
fn parse_command(prefix: &str, topic: &str, payload: &[u8]) -> Option<DeviceCommand> {
    let suffix = topic.strip_prefix(prefix)?.strip_prefix("/set/")?;
    let mut parts = suffix.splitn(2, '/');
    let device_id = parts.next()?.to_string();
    let property = parts.next()?.to_string();
    if device_id.is_empty() || property.is_empty() {
        return None;
    }

    let value = decode_payload(payload)?;
    Some(DeviceCommand {
        device_id,
        property,
        value,
    })
}

fn decode_payload(payload: &[u8]) -> Option<Value> {
    if payload.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<Json>(&text) {
        Ok(Json::Bool(b)) => Some(Value::Bool(b)),
        Ok(Json::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Some(Value::Int(i))
            } else {
                Some(Value::Float(n.as_f64().unwrap_or_default()))
            }
        }
        Ok(Json::String(s)) => Some(Value::String(s)),
        _ => Some(Value::String(text.into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_decodes_to_none() {
        assert!(decode_payload(b"").is_none());
    }

    #[test]
    fn non_json_payload_decodes_to_its_string_form() {
        assert_eq!(decode_payload(b"auto"), Some(Value::String("auto".into())));
    }

    #[test]
    fn json_scalars_decode_to_their_typed_value() {
        assert_eq!(decode_payload(b"true"), Some(Value::Bool(true)));
        assert_eq!(decode_payload(b"55"), Some(Value::Int(55)));
    }

    #[test]
    fn parse_command_splits_device_id_and_property() {
        let command = parse_command("local-tuya", "local-tuya/set/dehum1/power", b"true").unwrap();
        assert_eq!(command.device_id, "dehum1");
        assert_eq!(command.property, "power");
        assert_eq!(command.value, Value::Bool(true));
    }

    #[test]
    fn parse_command_rejects_topics_outside_the_set_namespace() {
        assert!(parse_command("local-tuya", "local-tuya/get/dehum1", b"true").is_none());
    }
}
