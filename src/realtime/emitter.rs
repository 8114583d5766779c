//! Change emitter used by write paths.
//!
//! Write operations call the emitter after a successful mutation; it builds
//! the change event and hands it to the bus without batching.

use std::sync::Arc;

use hostpilot_realtime_types::{ChangeEvent, EntityId, RealtimeAction, ResourceType};
use serde_json::{Map, Value};
use tracing::debug;

use super::bus::EventBus;

/// Publishes change events to the [`EventBus`].
///
/// # Usage
///
/// ```ignore
/// // After a booking was updated:
/// emitter.updated(ResourceType::Booking, booking.id, Some(booking.organization_id));
/// ```
#[derive(Clone)]
pub struct ChangeEmitter {
    bus: Arc<EventBus>,
}

impl ChangeEmitter {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Broadcast one change.
    pub fn emit(
        &self,
        resource: ResourceType,
        action: RealtimeAction,
        entity_id: Option<EntityId>,
        organization_id: Option<i64>,
        payload: Option<Map<String, Value>>,
    ) {
        let event = ChangeEvent {
            resource,
            action,
            entity_id,
            organization_id,
            payload,
        };
        self.emit_event(event);
    }

    /// Broadcast a prepared event.
    pub fn emit_event(&self, event: ChangeEvent) {
        debug!(
            resource = %event.resource,
            action = %event.action,
            organization_id = ?event.organization_id,
            "Emitting change"
        );
        self.bus.broadcast(event);
    }

    pub fn created(
        &self,
        resource: ResourceType,
        entity_id: impl Into<EntityId>,
        organization_id: Option<i64>,
    ) {
        self.emit(
            resource,
            RealtimeAction::Create,
            Some(entity_id.into()),
            organization_id,
            None,
        );
    }

    pub fn updated(
        &self,
        resource: ResourceType,
        entity_id: impl Into<EntityId>,
        organization_id: Option<i64>,
    ) {
        self.emit(
            resource,
            RealtimeAction::Update,
            Some(entity_id.into()),
            organization_id,
            None,
        );
    }

    pub fn deleted(
        &self,
        resource: ResourceType,
        entity_id: impl Into<EntityId>,
        organization_id: Option<i64>,
    ) {
        self.emit(
            resource,
            RealtimeAction::Delete,
            Some(entity_id.into()),
            organization_id,
            None,
        );
    }

    /// A broad change with no single affected record.
    pub fn bulk(&self, resource: ResourceType, organization_id: Option<i64>) {
        self.emit(resource, RealtimeAction::Bulk, None, organization_id, None);
    }

    /// Pass `result` through, emitting the event built from the success value
    /// only when the mutation succeeded.
    pub fn emit_on_success<T, E>(
        &self,
        result: Result<T, E>,
        event: impl FnOnce(&T) -> ChangeEvent,
    ) -> Result<T, E> {
        if let Ok(value) = &result {
            self.emit_event(event(value));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use hostpilot_realtime_types::StreamMessage;

    use super::super::bus::Frame;
    use super::*;

    fn next_event(sub: &mut super::super::bus::Subscription) -> Option<StreamMessage> {
        match sub.try_recv()? {
            Frame::Data(json) => StreamMessage::parse(&json).ok(),
            Frame::Heartbeat => None,
        }
    }

    #[tokio::test]
    async fn updated_broadcasts_entity_and_organization() {
        let bus = Arc::new(EventBus::default());
        let emitter = ChangeEmitter::new(Arc::clone(&bus));
        let mut sub = bus.add_client(Some(42));
        sub.try_recv();

        emitter.updated(ResourceType::Task, 11_i64, Some(42));

        let Some(StreamMessage::Event(event)) = next_event(&mut sub) else {
            panic!("expected event");
        };
        assert_eq!(event.action, RealtimeAction::Update);
        assert_eq!(event.entity_id, Some(EntityId::Number(11)));
    }

    #[tokio::test]
    async fn failed_mutation_emits_nothing() {
        let bus = Arc::new(EventBus::default());
        let emitter = ChangeEmitter::new(Arc::clone(&bus));
        let mut sub = bus.add_client(Some(1));
        sub.try_recv();

        let failed: Result<i64, &str> = emitter.emit_on_success(Err("constraint violated"), |id| {
            ChangeEvent::new(ResourceType::Booking, RealtimeAction::Create)
                .with_entity(*id)
                .with_organization(1)
        });
        assert!(failed.is_err());
        assert!(next_event(&mut sub).is_none());

        let created = emitter.emit_on_success(Ok::<i64, &str>(9), |id| {
            ChangeEvent::new(ResourceType::Booking, RealtimeAction::Create)
                .with_entity(*id)
                .with_organization(1)
        });
        assert_eq!(created, Ok(9));
        assert!(matches!(next_event(&mut sub), Some(StreamMessage::Event(_))));
    }

    #[tokio::test]
    async fn bulk_has_no_entity() {
        let bus = Arc::new(EventBus::default());
        let emitter = ChangeEmitter::new(Arc::clone(&bus));
        let mut sub = bus.add_client(None);
        sub.try_recv();

        emitter.bulk(ResourceType::Inventory, Some(3));

        let Some(StreamMessage::Event(event)) = next_event(&mut sub) else {
            panic!("expected event");
        };
        assert_eq!(event.action, RealtimeAction::Bulk);
        assert!(event.entity_id.is_none());
    }
}
