//! Bridge entry point: logging, config loading, MQTT connection,
//! Home-Assistant discovery, one `DeviceSession` per configured device, and
//! command fan-out from MQTT to the owning session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tuya_bridge::config::BridgeConfig;
use tuya_bridge::discovery;
use tuya_bridge::model::{DeviceModel, MeacoDehumidifier};
use tuya_bridge::mqtt::MqttAdapter;
use tuya_bridge::session::DeviceSession;

#[tokio::main]
async fn main() {
    init_tracing();

    let config_path = config_path();
    let config = match BridgeConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(path = %config_path.display(), error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    run(config, cancel).await;
}

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    std::env::var("TUYA_BRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("tuya-bridge.toml"))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn build_model(model_name: &str) -> Option<Box<dyn DeviceModel>> {
    match model_name {
        "meaco_dehumidifier" => Some(Box::new(MeacoDehumidifier::default())),
        _ => None,
    }
}

async fn run(config: BridgeConfig, cancel: CancellationToken) {
    let (mqtt, mut commands) = MqttAdapter::connect(config.mqtt, cancel.clone()).await;
    let mqtt = Arc::new(mqtt);

    let mut sessions: HashMap<String, DeviceSession> = HashMap::new();

    for device in config.devices {
        let Some(model) = build_model(&device.model) else {
            tracing::error!(device = %device.id, model = %device.model, "unknown device model, skipping");
            continue;
        };

        if let Err(err) = publish_discovery_for(&mqtt, &device.id, &device.name, &device.model).await {
            tracing::warn!(device = %device.id, error = %err, "failed to publish discovery configs");
        }

        tracing::info!(device = %device.id, name = %device.name, "starting device session");
        let session = DeviceSession::start(device.clone(), model, mqtt.clone());
        sessions.insert(device.id, session);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        match sessions.get(&command.device_id) {
                            Some(session) => {
                                if let Err(err) = session.dispatch_command(&command.property, command.value).await {
                                    tracing::warn!(device = %command.device_id, property = %command.property, error = %err, "command failed");
                                }
                            }
                            None => tracing::warn!(device = %command.device_id, "command for unknown device, ignoring"),
                        }
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!("shutting down device sessions");
    for (_, session) in sessions {
        session.stop().await;
    }
}

async fn publish_discovery_for(
    mqtt: &MqttAdapter,
    device_id: &str,
    device_name: &str,
    model_name: &str,
) -> Result<(), rumqttc::ClientError> {
    let entries = match model_name {
        "meaco_dehumidifier" => discovery::meaco_dehumidifier_entries(),
        _ => return Ok(()),
    };
    let configs = discovery::build_discovery_configs(mqtt.discovery_prefix(), mqtt.prefix(), device_id, device_name, &entries);
    for (topic, payload) in configs {
        mqtt.publish_discovery(&topic, &payload).await?;
    }
    Ok(())
}
