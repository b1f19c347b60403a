//! Typed domain events, published after commit for the automation engine and UI renderers.

use crate::model::SchemaProjection;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecordEventType {
    #[serde(rename = "onCreate")]
    OnCreate,
    #[serde(rename = "onUpdate")]
    OnUpdate,
    #[serde(rename = "onDelete")]
    OnDelete,
}

#[derive(Clone, Debug, Serialize)]
pub struct RecordEvent {
    pub event_type: RecordEventType,
    pub tenant_id: String,
    pub entity_name: String,
    pub record_id: Uuid,
    pub record: Value,
    /// Changed fields as `{field: {"before", "after"}}`; updates only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Value>,
    pub actor: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Record(RecordEvent),
    SchemaPublished(SchemaProjection),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget. Having no subscribers is not an error.
    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        bus.emit(DomainEvent::Record(RecordEvent {
            event_type: RecordEventType::OnDelete,
            tenant_id: "acme".into(),
            entity_name: "customer".into(),
            record_id: Uuid::nil(),
            record: json!({}),
            diff: None,
            actor: "ada".into(),
        }));
        let mut rx = bus.subscribe();
        for t in [RecordEventType::OnCreate, RecordEventType::OnUpdate] {
            bus.emit(DomainEvent::Record(RecordEvent {
                event_type: t,
                tenant_id: "acme".into(),
                entity_name: "customer".into(),
                record_id: Uuid::nil(),
                record: json!({"name": "Ada"}),
                diff: None,
                actor: "ada".into(),
            }));
        }
        let first = rx.recv().await.unwrap();
        let DomainEvent::Record(e) = first else { panic!("expected record event") };
        assert_eq!(e.event_type, RecordEventType::OnCreate);
        let v = serde_json::to_value(DomainEvent::Record(e)).unwrap();
        assert_eq!(v["kind"], "record");
        assert_eq!(v["event_type"], "onCreate");
        assert!(v.get("diff").is_none());
    }
}
