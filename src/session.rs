//! Per-device orchestration
//!
//! Assembles one device's bus, transport, sender, heartbeat, state keeper,
//! constraints and update buffer, and bridges it to the shared `MqttAdapter`:
//! wire state changes are translated through the device's model and
//! published, connection transitions are published as availability, and
//! inbound `DeviceCommand`s are translated back to wire datapoints and handed
//! to the update buffer. The overall per-device-assembly shape, plus its
//! MQTT bridging half, is grounded on `local_tuya/device/device.py`'s
//! `Device`.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, EventKind, SharedBus};
use crate::config::DeviceConfig;
use crate::model::DeviceModel;
use crate::mqtt::MqttAdapter;
use crate::sender::Sender;
use crate::state_keeper::StateKeeper;
use crate::transport::Transport;
use crate::update_buffer::{UpdateBuffer, UpdateError};
use crate::value::{Value, Values};
use crate::heartbeat::Heartbeat;

pub struct DeviceSession {
    pub id: String,
    model: Arc<AsyncMutex<Box<dyn DeviceModel>>>,
    update_buffer: UpdateBuffer,
    heartbeat: Heartbeat,
    state_keeper: StateKeeper,
    transport: Transport,
    cancel: CancellationToken,
    publish_task: JoinHandle<()>,
    availability_task: JoinHandle<()>,
}

impl DeviceSession {
    pub fn start(config: DeviceConfig, model: Box<dyn DeviceModel>, mqtt: Arc<MqttAdapter>) -> Self {
        let bus: SharedBus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();

        let constraints = model.constraints();
        let model = Arc::new(AsyncMutex::new(model));

        let transport = Transport::start(bus.clone(), config.transport.clone());
        let sender = Sender::start(bus.clone(), config.key, config.transport.timeout);
        let heartbeat = Heartbeat::start(bus.clone(), sender.clone(), config.heartbeat_interval, cancel.clone());
        let state_keeper = StateKeeper::start(bus.clone(), sender.clone(), config.state_refresh_interval, cancel.clone());
        let update_buffer = UpdateBuffer::start(sender, state_keeper.watch(), constraints, config.update_buffer.clone(), cancel.clone());

        let publish_task = spawn_state_publisher(bus.clone(), model.clone(), mqtt.clone(), config.id.clone());
        let availability_task = spawn_availability_publisher(bus, mqtt, config.id.clone());

        Self {
            id: config.id,
            model,
            update_buffer,
            heartbeat,
            state_keeper,
            transport,
            cancel,
            publish_task,
            availability_task,
        }
    }

    /// Translate an inbound `{property: value}` MQTT command through the
    /// device model and hand the resulting wire datapoints to the update
    /// buffer.
    pub async fn dispatch_command(&self, property: &str, value: Value) -> Result<(), UpdateError> {
        let mut external = Values::new();
        external.insert(property.to_string(), value);

        let wire = {
            let model = self.model.lock().await;
            model.to_wire(&external)
        };

        if wire.is_empty() {
            tracing::warn!(device = %self.id, property, "command does not map to a writable datapoint, ignoring");
            return Ok(());
        }

        self.update_buffer.update(wire).await
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        self.update_buffer.stop().await;
        self.heartbeat.stop().await;
        self.state_keeper.stop().await;
        self.publish_task.abort();
        let _ = self.publish_task.await;
        self.availability_task.abort();
        let _ = self.availability_task.await;
        self.transport.close().await;
    }
}

fn spawn_state_publisher(
    bus: SharedBus,
    model: Arc<AsyncMutex<Box<dyn DeviceModel>>>,
    mqtt: Arc<MqttAdapter>,
    device_id: String,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<Values>(32);

    bus.register(
        EventKind::StateUpdated,
        Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Event::StateUpdated(values) = event {
                    tx.send(values)
                        .await
                        .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> { "state publisher gone".into() })?;
                }
                Ok(())
            })
        }),
    );

    tokio::spawn(async move {
        while let Some(wire) = rx.recv().await {
            let external = {
                let mut model = model.lock().await;
                model.from_wire(&wire)
            };
            if let Err(err) = mqtt.publish_state(&device_id, &external).await {
                tracing::warn!(device = %device_id, error = %err, "failed to publish device state");
            }
        }
    })
}

fn spawn_availability_publisher(bus: SharedBus, mqtt: Arc<MqttAdapter>, device_id: String) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<bool>(8);

    let forward = tx.clone();
    bus.register(
        EventKind::ConnectionEstablished,
        Arc::new(move |_| {
            let forward = forward.clone();
            Box::pin(async move {
                let _ = forward.send(true).await;
                Ok(())
            })
        }),
    );

    bus.register(
        EventKind::ConnectionClosed,
        Arc::new(move |_| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(false).await;
                Ok(())
            })
        }),
    );

    tokio::spawn(async move {
        while let Some(online) = rx.recv().await {
            if let Err(err) = mqtt.publish_availability(&device_id, online).await {
                tracing::warn!(device = %device_id, error = %err, "failed to publish device availability");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::config::DeviceConfig;
    use crate::model::MeacoDehumidifier;
    use crate::transport::TransportConfig;
    use crate::update_buffer::UpdateBufferConfig;
    use std::time::Duration;

    fn test_device_config() -> DeviceConfig {
        DeviceConfig {
            name: "Test Dehumidifier".into(),
            id: "dehum1".into(),
            model: "meaco_dehumidifier".into(),
            key: *b"9efe59a10acd6ccf",
            transport: TransportConfig {
                address: "127.0.0.1".into(),
                port: 1,
                timeout: Duration::from_millis(20),
                backoff: Backoff::new([0.0]),
            },
            heartbeat_interval: Duration::from_secs(15),
            state_refresh_interval: Duration::from_secs(3600),
            update_buffer: UpdateBufferConfig {
                debounce: Duration::from_millis(5),
                retries: 0,
                retry_backoff: Backoff::new([0.0]),
            },
        }
    }

    #[tokio::test]
    async fn dispatch_command_ignores_unmapped_properties() {
        // No broker running; only exercises the model-mapping short-circuit,
        // not the MQTT adapter.
        let config = test_device_config();
        let model: Box<dyn DeviceModel> = Box::new(MeacoDehumidifier::default());
        let model = Arc::new(AsyncMutex::new(model));
        let wire = {
            let m = model.lock().await;
            let mut external = Values::new();
            external.insert("not_a_real_property".into(), Value::Bool(true));
            m.to_wire(&external)
        };
        assert!(wire.is_empty());
        let _ = config; // constructed to demonstrate the shape used by start()
    }
}
