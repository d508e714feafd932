pub mod pseudo;
pub mod publisher;
pub mod tracker;

use log::{debug, warn};
use std::fmt;

use crate::config::{ParameterConfig, ParameterName};
use crate::metering_62056::structs::{DataSet, MeterIdentity};
use crate::mqtt::ha_interface::{config_topic, state_topic, topic_base, EntityKind};

#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Text(String),
    Flag(bool),
    Number(f64),
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Text(s) => write!(f, "{s}"),
            StateValue::Flag(b) => write!(f, "{b}"),
            StateValue::Number(n) => write!(f, "{n}"),
        }
    }
}

/// One entity ready to be published: identity, labels, topics and value.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub kind: EntityKind,
    pub address: String,
    /* Position in the reading the value was taken from */
    pub index: usize,
    pub identity: MeterIdentity,
    pub device_id: String,
    pub unique_id: String,
    pub name: String,
    pub config_topic: String,
    pub state_topic: String,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit: Option<String>,
    pub value: StateValue,
    /* Published by the broker on unclean disconnect */
    pub last_will: Option<StateValue>,
}

/// Builds the entities for a meter reading of `descriptor`.
///
/// `response_idx` narrows the reading to one entry first. An index past the
/// end yields no entities. When more than one entry remains, unique ids get
/// a `_N` suffix and names are taken per position.
pub fn derive(descriptor: &ParameterConfig, reading: &[DataSet], identity: &MeterIdentity, prefix: &str) -> Vec<EntityView> {
    let values = reading.iter()
        .map(|d| StateValue::Text(d.value.clone()))
        .collect();
    return derive_values(descriptor, values, identity, prefix, EntityKind::Numeric);
}

pub fn derive_values(descriptor: &ParameterConfig, mut values: Vec<StateValue>, identity: &MeterIdentity, prefix: &str, kind: EntityKind) -> Vec<EntityView> {
    if let Some(idx) = descriptor.response_idx {
        if idx >= values.len() {
            warn!("Response for entry at '{}' doesn't contain element at index '{}', skipping. Response: {:?}",
                  descriptor.address, idx, values);
            return Vec::new();
        }
        values = vec![values.swap_remove(idx)];
    }

    let multi = values.len() > 1;
    let device_id = identity.device_id();
    let base_id = format!("{}_{}", device_id, descriptor.entity_name.as_deref().unwrap_or(&descriptor.address));

    values.into_iter().enumerate().map(|(idx, value)| {
        let (unique_id, name) = if multi {
            (format!("{base_id}_{idx}"), indexed_name(descriptor, idx))
        } else {
            (base_id.clone(), first_name(descriptor))
        };
        debug!("Using '{}' as name for entry at '{}' address", name, descriptor.address);

        let base = topic_base(prefix, kind, &device_id, &unique_id);
        EntityView {
            kind,
            address: descriptor.address.clone(),
            index: idx,
            identity: identity.clone(),
            device_id: device_id.clone(),
            unique_id,
            name,
            config_topic: config_topic(&base),
            state_topic: state_topic(&base),
            device_class: descriptor.device_class.clone(),
            state_class: descriptor.state_class.clone(),
            unit: descriptor.unit.clone(),
            value,
            last_will: None,
        }
    }).collect()
}

fn first_name(descriptor: &ParameterConfig) -> String {
    match &descriptor.name {
        ParameterName::Single(n) => n.clone(),
        ParameterName::PerIndex(names) => match names.first() {
            Some(n) => n.clone(),
            None => descriptor.address.clone(),
        },
    }
}

fn indexed_name(descriptor: &ParameterConfig, idx: usize) -> String {
    match &descriptor.name {
        ParameterName::Single(n) => format!("{n} {idx}"),
        ParameterName::PerIndex(names) => match names.get(idx) {
            Some(n) => n.clone(),
            None => format!("{} {}", descriptor.address, idx),
        },
    }
}
