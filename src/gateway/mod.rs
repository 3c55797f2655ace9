//! Abstract interface to the home-automation platform (§4.7). Read entity
//! state, subscribe to state-change events, call services, report connection
//! health. Concrete implementations handle transport details; the core never
//! depends on them directly.

pub mod dry_run;
pub mod home_assistant;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::HagError;

pub use dry_run::DryRunGateway;
pub use home_assistant::HomeAssistantGateway;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub state: String,
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub new_state: String,
    pub old_state: Option<String>,
}

pub type StateChangeHandler = Box<dyn Fn(StateChangedEvent) + Send + Sync>;

/// Operations consumed by the controller loop and actuator. Implementations
/// own their transport and reconnect state; callers never see partial or
/// torn connection state, only `ConnectionError`.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    async fn connect(&self) -> Result<(), HagError>;
    async fn disconnect(&self) -> Result<(), HagError>;
    async fn get_state(&self, entity_id: &str) -> Result<EntityState, HagError>;
    async fn subscribe_state_changed(&self, handler: StateChangeHandler) -> Result<(), HagError>;
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> Result<(), HagError>;

    /// Convenience wrapper used by the actuator: builds `{entity_id,
    /// <value_key>: value}` and calls `<domain>.<service>`.
    async fn control_entity(
        &self,
        entity_id: &str,
        domain: &str,
        service: &str,
        value_key: &str,
        value: &str,
    ) -> Result<(), HagError> {
        let data = serde_json::json!({
            "entity_id": entity_id,
            value_key: value,
        });
        self.call_service(domain, service, data).await
    }

    /// Whether the transport currently considers itself connected.
    fn is_connected(&self) -> bool;
}
