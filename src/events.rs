use crate::models::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StorageEvent {
    EntityCreated {
        entity_type: String,
        id: String,
        data: Record,
    },
    EntityUpdated {
        entity_type: String,
        id: String,
        data: Record,
    },
    EntityDeleted {
        entity_type: String,
        id: String,
    },
    SettingChanged {
        key: String,
        value: Value,
        old_value: Option<Value>,
    },
    SettingDeleted {
        key: String,
    },
    MetadataStored {
        key: String,
        metadata: Value,
    },
    MetadataUpdated {
        key: String,
        metadata: Value,
    },
    MetadataDeleted {
        key: String,
    },
    Error {
        operation: String,
        entity_type: Option<String>,
        message: String,
    },
    Initialized,
}

impl StorageEvent {
    /// `error` and `initialized` pass through the adapter without a source tag.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Initialized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventSource {
    Entity,
    Settings,
    Metadata,
    Encryption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcedEvent {
    pub source: Option<EventSource>,
    pub event: StorageEvent,
}

impl SourcedEvent {
    pub fn tagged(source: EventSource, event: StorageEvent) -> Self {
        let source = if event.is_reserved() { None } else { Some(source) };
        Self { source, event }
    }

    pub fn untagged(event: StorageEvent) -> Self {
        Self { source: None, event }
    }
}

/// Broadcast channel wrapper. Publishing without subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone = StorageEvent> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}
