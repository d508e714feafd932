use log::{debug, error};
use thiserror::Error;

use super::tracker::PublicationTracker;
use super::{EntityView, StateValue};
use crate::mqtt::ha_interface::{EntityKind, HaDevice, HaDiscovery, HaState, VALUE_TEMPLATE};
use crate::mqtt::{BusError, MessageBus, MqttConnectionStatus};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("Unable to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Unsupported value {value:?} for {kind:?} entity")]
    UnsupportedValue { kind: EntityKind, value: StateValue },
}

pub fn discovery_payload(view: &EntityView) -> HaDiscovery {
    let (device_class, unit, state_class) = match view.kind {
        EntityKind::Numeric => (view.device_class.clone(), view.unit.clone(), view.state_class.clone()),
        EntityKind::Binary => (view.device_class.clone(), None, None),
        EntityKind::Diagnostic => (None, view.unit.clone(), None),
    };

    return HaDiscovery {
        name: view.name.clone(),
        device: HaDevice::from_identity(&view.identity),
        device_class,
        unique_id: view.unique_id.clone(),
        object_id: view.unique_id.clone(),
        unit_of_measurement: unit,
        state_class,
        state_topic: view.state_topic.clone(),
        value_template: VALUE_TEMPLATE.to_string(),
    };
}

pub fn state_payload(kind: EntityKind, value: &StateValue) -> Result<HaState, PublishError> {
    let value = match (kind, value) {
        (EntityKind::Binary, StateValue::Flag(b)) => on_off(*b),
        (EntityKind::Binary, StateValue::Text(s)) => on_off(s.eq_ignore_ascii_case("true")),
        (EntityKind::Binary, other) => {
            return Err(PublishError::UnsupportedValue { kind, value: other.clone() });
        },
        (_, other) => other.to_string(),
    };
    return Ok(HaState { value });
}

fn on_off(value: bool) -> String {
    if value { "ON".to_string() } else { "OFF".to_string() }
}

/// Sends entities over the bus, discovery first and then state.
pub struct EntityPublisher<'a, B: MessageBus> {
    bus: &'a mut B,
    tracker: &'a mut PublicationTracker,
}

impl<'a, B: MessageBus> EntityPublisher<'a, B> {
    pub fn new(bus: &'a mut B, tracker: &'a mut PublicationTracker) -> Self {
        return EntityPublisher { bus, tracker };
    }

    /// Publishes a single entity. With `setup_only` only the last will is
    /// registered. The will is only ever handed to a bus that is not
    /// connected, a live session keeps the one it was opened with.
    pub async fn publish(&mut self, view: &EntityView, setup_only: bool) -> Result<(), PublishError> {
        if let Some(will) = &view.last_will {
            if self.bus.status() == MqttConnectionStatus::Connected {
                debug!("MQTT is connected, keeping the last will of the current session for '{}'", view.state_topic);
            } else {
                let will_payload = serde_json::to_string(&state_payload(view.kind, will)?)?;
                self.bus.set_last_will(&view.state_topic, &will_payload).await?;
                debug!("Set state topic '{}' for MQTT last will, payload: '{}'", view.state_topic, will_payload);
            }
        }

        if setup_only {
            return Ok(());
        }

        let config_payload = serde_json::to_string(&discovery_payload(view))?;
        if self.tracker.should_publish_config(&view.unique_id, &config_payload) {
            debug!("MQTT config payload for HA discovery: '{config_payload}'");
            self.bus.publish(&view.config_topic, &config_payload, true).await?;
            self.tracker.record_published(&view.unique_id, &config_payload);
        }

        let state = serde_json::to_string(&state_payload(view.kind, &view.value)?)?;
        debug!("MQTT state payload: '{state}'");
        self.bus.publish(&view.state_topic, &state, false).await?;
        return Ok(());
    }

    /// Publishes every entity, a failing one is logged and skipped. Returns
    /// the number of entities that went through.
    pub async fn publish_all(&mut self, views: &[EntityView], setup_only: bool) -> usize {
        let mut published = 0;
        for view in views {
            match self.publish(view, setup_only).await {
                Ok(()) => published += 1,
                Err(e) => {
                    error!("Got error while processing entity at address {} (index {}), skipping to next. Entity: {:?}. Error: {}",
                           view.address, view.index, view, e);
                }
            }
        }
        return published;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterName;
    use crate::metering_62056::structs::DataSet;
    use crate::mqtt::tests::{BusCall, RecordingBus};
    use crate::sensors::derive;
    use crate::sensors::tests::{identity, parameter};

    fn current_views() -> Vec<EntityView> {
        let mut param = parameter("CURRE", ParameterName::Single("Current".to_string()));
        param.device_class = Some("current".to_string());
        param.state_class = Some("measurement".to_string());
        param.unit = Some("A".to_string());
        derive(&param, &[DataSet::new("CURRE", "1.479"), DataSet::new("CURRE", "2.8716")], &identity(), "homeassistant")
    }

    fn connected_bus() -> RecordingBus {
        RecordingBus { connected: true, ..Default::default() }
    }

    #[test]
    fn test_discovery_payload_per_kind() {
        let mut view = current_views().remove(0);
        let payload = discovery_payload(&view);
        assert_eq!(payload.device_class.as_deref(), Some("current"));
        assert_eq!(payload.unit_of_measurement.as_deref(), Some("A"));
        assert_eq!(payload.state_class.as_deref(), Some("measurement"));
        assert_eq!(payload.object_id, payload.unique_id);
        assert_eq!(payload.device.name, "00123456");
        assert_eq!(payload.value_template, "{{ value_json.value }}");

        view.kind = EntityKind::Binary;
        let payload = discovery_payload(&view);
        assert_eq!(payload.device_class.as_deref(), Some("current"));
        assert!(payload.unit_of_measurement.is_none() && payload.state_class.is_none());

        view.kind = EntityKind::Diagnostic;
        let payload = discovery_payload(&view);
        assert!(payload.device_class.is_none() && payload.state_class.is_none());
        assert_eq!(payload.unit_of_measurement.as_deref(), Some("A"));
    }

    #[test]
    fn test_state_payload() {
        let on = |v: StateValue| state_payload(EntityKind::Binary, &v).unwrap().value;
        assert_eq!(on(StateValue::Flag(true)), "ON");
        assert_eq!(on(StateValue::Flag(false)), "OFF");
        assert_eq!(on(StateValue::Text("True".to_string())), "ON");
        assert_eq!(on(StateValue::Text("yes".to_string())), "OFF");
        assert!(matches!(
            state_payload(EntityKind::Binary, &StateValue::Number(1.0)),
            Err(PublishError::UnsupportedValue { .. })
        ));

        assert_eq!(state_payload(EntityKind::Numeric, &StateValue::Text("1.479".to_string())).unwrap().value, "1.479");
        assert_eq!(state_payload(EntityKind::Diagnostic, &StateValue::Number(1500.5)).unwrap().value, "1500.5");
    }

    #[tokio::test]
    async fn test_publish_config_once() {
        let mut bus = connected_bus();
        let mut tracker = PublicationTracker::new();
        let views = current_views();

        let mut publisher = EntityPublisher::new(&mut bus, &mut tracker);
        assert_eq!(publisher.publish_all(&views, false).await, 2);
        assert_eq!(publisher.publish_all(&views, false).await, 2);

        let config_topic = &views[0].config_topic;
        let state_topic = &views[0].state_topic;
        assert_eq!(bus.publishes_to(config_topic).len(), 1);
        assert_eq!(bus.publishes_to(state_topic), vec![r#"{"value":"1.479"}"#; 2]);

        let publishes = bus.publishes();
        assert_eq!(publishes[0].0, *config_topic);
        assert!(publishes[0].2, "discovery is retained");
        assert_eq!(publishes[1].0, *state_topic);
        assert!(!publishes[1].2, "state is not retained");
    }

    #[tokio::test]
    async fn test_setup_only_sets_last_will() {
        let mut bus = RecordingBus::default();
        let mut tracker = PublicationTracker::new();
        let mut view = current_views().remove(0);
        view.kind = EntityKind::Binary;
        view.last_will = Some(StateValue::Flag(false));

        EntityPublisher::new(&mut bus, &mut tracker).publish(&view, true).await.unwrap();
        assert_eq!(bus.calls, vec![BusCall::SetLastWill {
            topic: view.state_topic.clone(),
            payload: r#"{"value":"OFF"}"#.to_string(),
        }]);
        assert!(tracker.should_publish_config(&view.unique_id, ""));
    }

    #[tokio::test]
    async fn test_last_will_not_set_on_connected_bus() {
        let mut bus = connected_bus();
        let mut tracker = PublicationTracker::new();
        let mut view = current_views().remove(0);
        view.kind = EntityKind::Binary;
        view.value = StateValue::Flag(true);
        view.last_will = Some(StateValue::Flag(false));

        let mut publisher = EntityPublisher::new(&mut bus, &mut tracker);
        publisher.publish(&view, true).await.unwrap();
        publisher.publish(&view, false).await.unwrap();

        assert!(!bus.calls.iter().any(|c| matches!(c, BusCall::SetLastWill { .. })));
        assert_eq!(bus.publishes_to(&view.state_topic), vec![r#"{"value":"ON"}"#]);
    }

    #[tokio::test]
    async fn test_failing_entity_is_skipped() {
        let views = current_views();
        let mut bus = connected_bus();
        bus.failing_topics.push(views[0].config_topic.clone());
        let mut tracker = PublicationTracker::new();

        let published = EntityPublisher::new(&mut bus, &mut tracker).publish_all(&views, false).await;
        assert_eq!(published, 1);
        assert!(bus.publishes_to(&views[0].state_topic).is_empty());
        assert_eq!(bus.publishes_to(&views[1].state_topic), vec![r#"{"value":"2.8716"}"#]);
        /* Not recorded, so it is retried next time */
        assert!(tracker.should_publish_config(&views[0].unique_id, "anything"));
    }

    #[tokio::test]
    async fn test_unsupported_binary_value() {
        let mut view = current_views().remove(0);
        view.kind = EntityKind::Binary;
        view.value = StateValue::Number(3.0);
        let mut bus = connected_bus();
        let mut tracker = PublicationTracker::new();

        let result = EntityPublisher::new(&mut bus, &mut tracker).publish(&view, false).await;
        assert!(matches!(result, Err(PublishError::UnsupportedValue { .. })));
        /* Discovery went out before the value was rejected */
        assert_eq!(bus.publishes().len(), 1);
    }
}
