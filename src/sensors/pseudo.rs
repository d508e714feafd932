use std::time::Duration;

use super::{derive_values, EntityView, StateValue};
use crate::config::{ParameterConfig, ParameterName};
use crate::metering_62056::structs::MeterIdentity;
use crate::mqtt::ha_interface::EntityKind;

pub const ONLINE_ADDRESS: &str = "IS_ONLINE";
pub const CYCLE_DURATION_ADDRESS: &str = "CYCLE_DURATION";

fn pseudo_parameter(address: &str, name: &str, device_class: Option<&str>, unit: Option<&str>) -> ParameterConfig {
    return ParameterConfig {
        address: address.to_string(),
        name: ParameterName::Single(name.to_string()),
        device_class: device_class.map(String::from),
        state_class: None,
        unit: unit.map(String::from),
        additional_data: None,
        entity_name: None,
        response_idx: None,
    }
}

fn single(views: Vec<EntityView>) -> Option<EntityView> {
    views.into_iter().next()
}

/// Connectivity of the meter, reported OFF by the broker if the bridge dies.
pub fn online_entity(identity: &MeterIdentity, prefix: &str, online: bool) -> Option<EntityView> {
    let param = pseudo_parameter(ONLINE_ADDRESS, "Meter online status", Some("connectivity"), None);
    let mut view = single(derive_values(&param, vec![StateValue::Flag(online)], identity, prefix, EntityKind::Binary))?;
    view.last_will = Some(StateValue::Flag(false));
    return Some(view);
}

pub fn cycle_duration_entity(identity: &MeterIdentity, prefix: &str, elapsed: Duration) -> Option<EntityView> {
    let param = pseudo_parameter(CYCLE_DURATION_ADDRESS, "Meter cycle duration", None, Some("ms"));
    let ms = elapsed.as_secs_f64() * 1000.0;
    single(derive_values(&param, vec![StateValue::Number(ms)], identity, prefix, EntityKind::Diagnostic))
}
