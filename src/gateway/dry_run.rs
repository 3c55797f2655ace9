//! No-op gateway variant used for `validate`, local testing, and the
//! actuator's unit tests. Logs intended calls instead of issuing them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::HagError;
use crate::gateway::{EntityState, PlatformGateway, StateChangeHandler, StateChangedEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub entity_id: String,
    pub service: String,
    pub value: String,
}

pub struct DryRunGateway {
    states: RwLock<HashMap<String, EntityState>>,
    calls: RwLock<Vec<RecordedCall>>,
    connected: AtomicBool,
}

impl Default for DryRunGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub async fn seed_state(&self, entity_id: &str, state: EntityState) {
        self.states.write().await.insert(entity_id.to_string(), state);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl PlatformGateway for DryRunGateway {
    async fn connect(&self) -> Result<(), HagError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HagError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_state(&self, entity_id: &str) -> Result<EntityState, HagError> {
        self.states
            .read()
            .await
            .get(entity_id)
            .cloned()
            .ok_or_else(|| HagError::EntityNotFound(entity_id.to_string()))
    }

    async fn subscribe_state_changed(&self, _handler: StateChangeHandler) -> Result<(), HagError> {
        Ok(())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> Result<(), HagError> {
        let entity_id = data
            .get("entity_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let value = data
            .as_object()
            .and_then(|obj| obj.iter().find(|(k, _)| *k != "entity_id"))
            .and_then(|(_, v)| v.as_str())
            .unwrap_or_default()
            .to_string();

        tracing::debug!(domain, service, entity_id = %entity_id, value = %value, "dry-run service call");
        self.calls.write().await.push(RecordedCall {
            entity_id,
            service: service.to_string(),
            value,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Used for unit-testing `StateChangedEvent` plumbing without a live dry-run
/// subscription (the dry-run gateway never delivers events on its own).
pub fn synthetic_event(entity_id: &str, new_state: &str, old_state: Option<&str>) -> StateChangedEvent {
    StateChangedEvent {
        entity_id: entity_id.to_string(),
        new_state: new_state.to_string(),
        old_state: old_state.map(str::to_string),
    }
}
