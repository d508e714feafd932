use serde::Serialize;

use crate::metering_62056::structs::MeterIdentity;

pub const VALUE_TEMPLATE: &str = "{{ value_json.value }}";

/// How an entity is presented to Home Assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Meter readings, numeric or text
    Numeric,
    /// ON/OFF values, e.g. connectivity
    Binary,
    /// Bridge-internal measurements
    Diagnostic,
}

impl EntityKind {
    pub fn platform(&self) -> &'static str {
        match self {
            EntityKind::Binary => "binary_sensor",
            EntityKind::Numeric | EntityKind::Diagnostic => "sensor",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaDevice {
    pub name: String,
    pub ids: String,
    pub model: String,
    pub sw_version: String,
}

impl HaDevice {
    pub fn from_identity(identity: &MeterIdentity) -> Self {
        return HaDevice {
            name: identity.serial_number.clone(),
            ids: identity.device_id(),
            model: identity.model.clone(),
            sw_version: identity.sw_version.clone(),
        }
    }
}

/* Field order is the order on the wire, which feeds the content hash */
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaDiscovery {
    pub name: String,
    pub device: HaDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    pub unique_id: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    pub state_topic: String,
    pub value_template: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaState {
    pub value: String,
}

/// `{prefix}/{platform}/{device_id}/{unique_id}`, the prefix is left out
/// when empty.
pub fn topic_base(prefix: &str, kind: EntityKind, device_id: &str, unique_id: &str) -> String {
    let mut parts = Vec::with_capacity(4);
    if !prefix.is_empty() {
        parts.push(prefix);
    }
    parts.push(kind.platform());
    parts.push(device_id);
    parts.push(unique_id);
    return parts.join("/");
}

pub fn config_topic(base: &str) -> String {
    format!("{base}/config")
}

pub fn state_topic(base: &str) -> String {
    format!("{base}/state")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> MeterIdentity {
        MeterIdentity {
            model: "CE301".to_string(),
            sw_version: "12".to_string(),
            serial_number: "00123456".to_string(),
        }
    }

    #[test]
    fn test_topics() {
        let base = topic_base("homeassistant", EntityKind::Numeric, "CE301_00123456", "CE301_00123456_CURRE_0");
        assert_eq!(base, "homeassistant/sensor/CE301_00123456/CE301_00123456_CURRE_0");
        assert_eq!(config_topic(&base), format!("{base}/config"));
        assert_eq!(state_topic(&base), format!("{base}/state"));

        assert_eq!(
            topic_base("", EntityKind::Binary, "CE301_00123456", "CE301_00123456_IS_ONLINE"),
            "binary_sensor/CE301_00123456/CE301_00123456_IS_ONLINE"
        );
        assert_eq!(EntityKind::Diagnostic.platform(), "sensor");
    }

    #[test]
    fn test_discovery_serialization_skips_missing() {
        let discovery = HaDiscovery {
            name: "Meter online status".to_string(),
            device: HaDevice::from_identity(&identity()),
            device_class: Some("connectivity".to_string()),
            unique_id: "CE301_00123456_IS_ONLINE".to_string(),
            object_id: "CE301_00123456_IS_ONLINE".to_string(),
            unit_of_measurement: None,
            state_class: None,
            state_topic: "homeassistant/binary_sensor/CE301_00123456/CE301_00123456_IS_ONLINE/state".to_string(),
            value_template: VALUE_TEMPLATE.to_string(),
        };

        assert_eq!(
            serde_json::to_string(&discovery).unwrap(),
            concat!(
                r#"{"name":"Meter online status","#,
                r#""device":{"name":"00123456","ids":"CE301_00123456","model":"CE301","sw_version":"12"},"#,
                r#""device_class":"connectivity","#,
                r#""unique_id":"CE301_00123456_IS_ONLINE","object_id":"CE301_00123456_IS_ONLINE","#,
                r#""state_topic":"homeassistant/binary_sensor/CE301_00123456/CE301_00123456_IS_ONLINE/state","#,
                r#""value_template":"{{ value_json.value }}"}"#
            )
        );
    }
}
