//! Home-Assistant MQTT discovery payload construction
//!
//! Grounded on `local_tuya/mqtt/discovery.py`: one retained config payload
//! per exposed property, published to
//! `"{discoveryPrefix}/{type}/{deviceId}/{property}/config"`.

use serde_json::{Value as Json, json};

/// The Home-Assistant MQTT integration component a datapoint is discovered
/// as. Chosen per property below, mirroring the reference implementation's
/// per-datapoint component table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Switch,
    Select { options: &'static [&'static str] },
    Number { min: f64, max: f64, step: f64 },
    Sensor { unit: &'static str },
    BinarySensor,
}

impl Component {
    fn type_name(self) -> &'static str {
        match self {
            Component::Switch => "switch",
            Component::Select { .. } => "select",
            Component::Number { .. } => "number",
            Component::Sensor { .. } => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }

    fn writable(self) -> bool {
        !matches!(self, Component::Sensor { .. } | Component::BinarySensor)
    }
}

pub struct DiscoveryEntry {
    pub property: &'static str,
    pub component: Component,
}

/// The bundled `MeacoDehumidifier` model's discoverable properties. Kept
/// here rather than on `DeviceModel` since discovery concerns (units,
/// HA component choice) are an MQTT/HA-facing detail, not part of the wire
/// mapping `model.rs` owns.
pub fn meaco_dehumidifier_entries() -> Vec<DiscoveryEntry> {
    vec![
        DiscoveryEntry {
            property: "power",
            component: Component::Switch,
        },
        DiscoveryEntry {
            property: "mode",
            component: Component::Select {
                options: &["manual", "auto", "drying", "continuous"],
            },
        },
        DiscoveryEntry {
            property: "target_humidity",
            component: Component::Number {
                min: 35.0,
                max: 70.0,
                step: 5.0,
            },
        },
        DiscoveryEntry {
            property: "child_lock",
            component: Component::Switch,
        },
        DiscoveryEntry {
            property: "countdown_set",
            component: Component::Select {
                options: &["cancel", "1h", "2h", "3h"],
            },
        },
        DiscoveryEntry {
            property: "countdown_left",
            component: Component::Sensor { unit: "h" },
        },
        DiscoveryEntry {
            property: "current_humidity",
            component: Component::Sensor { unit: "%" },
        },
        DiscoveryEntry {
            property: "fault",
            component: Component::Sensor { unit: "" },
        },
    ]
}

/// Build `(topic, payload)` for every entry, for one device.
pub fn build_discovery_configs(
    discovery_prefix: &str,
    state_prefix: &str,
    device_id: &str,
    device_name: &str,
    entries: &[DiscoveryEntry],
) -> Vec<(String, Json)> {
    entries
        .iter()
        .map(|entry| {
            let topic = format!(
                "{discovery_prefix}/{}/{device_id}/{}/config",
                entry.component.type_name(),
                entry.property
            );
            (topic, build_payload(state_prefix, device_id, device_name, entry))
        })
        .collect()
}

fn build_payload(state_prefix: &str, device_id: &str, device_name: &str, entry: &DiscoveryEntry) -> Json {
    let unique_id = format!("{device_id}_{}", entry.property);
    let state_topic = format!("{state_prefix}/get/{device_id}");
    let availability_topic = format!("{state_prefix}/status/{device_id}");
    let value_template = format!("{{{{ value_json.{} }}}}", entry.property);

    let mut payload = json!({
        "name": entry.property,
        "unique_id": unique_id,
        "state_topic": state_topic,
        "value_template": value_template,
        "availability_topic": availability_topic,
        "payload_available": "online",
        "payload_not_available": "offline",
        "device": {
            "identifiers": [device_id],
            "name": device_name,
        },
    });

    if entry.component.writable() {
        let command_topic = format!("{state_prefix}/set/{device_id}/{}", entry.property);
        payload["command_topic"] = json!(command_topic);
    }

    match entry.component {
        Component::Switch => {
            payload["payload_on"] = json!(true);
            payload["payload_off"] = json!(false);
            payload["state_on"] = json!(true);
            payload["state_off"] = json!(false);
        }
        Component::Select { options } => {
            payload["options"] = json!(options);
        }
        Component::Number { min, max, step } => {
            payload["min"] = json!(min);
            payload["max"] = json!(max);
            payload["step"] = json!(step);
        }
        Component::Sensor { unit } => {
            payload["unit_of_measurement"] = json!(unit);
        }
        Component::BinarySensor => {
            payload["payload_on"] = json!(true);
            payload["payload_off"] = json!(false);
        }
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_shape_matches_the_documented_pattern() {
        let entries = meaco_dehumidifier_entries();
        let configs = build_discovery_configs("homeassistant", "local-tuya", "dehum1", "Study Dehumidifier", &entries);
        let (topic, _) = configs.iter().find(|(t, _)| t.contains("/power/")).unwrap();
        assert_eq!(topic, "homeassistant/switch/dehum1/power/config");
    }

    #[test]
    fn read_only_sensors_have_no_command_topic() {
        let entries = meaco_dehumidifier_entries();
        let configs = build_discovery_configs("homeassistant", "local-tuya", "dehum1", "Study Dehumidifier", &entries);
        let (_, payload) = configs.iter().find(|(t, _)| t.contains("/current_humidity/")).unwrap();
        assert!(payload.get("command_topic").is_none());
        assert_eq!(payload["unit_of_measurement"], "%");
    }

    #[test]
    fn writable_switch_has_a_command_topic() {
        let entries = meaco_dehumidifier_entries();
        let configs = build_discovery_configs("homeassistant", "local-tuya", "dehum1", "Study Dehumidifier", &entries);
        let (_, payload) = configs.iter().find(|(t, _)| t.contains("/power/")).unwrap();
        assert_eq!(payload["command_topic"], "local-tuya/set/dehum1/power");
    }
}
