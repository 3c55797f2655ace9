//! Translates state-machine entry actions into per-entity service calls. See
//! spec §4.3. Applies the per-unit heating/cooling policy using each unit's
//! own derived room sensor.

use std::sync::{Arc, Mutex};

use crate::config::{CoolingParams, HeatingParams, HvacUnitDescriptor};
use crate::gateway::PlatformGateway;
use crate::state_machine::EntryAction;

pub struct Actuator {
    gateway: Arc<dyn PlatformGateway>,
    units: Vec<HvacUnitDescriptor>,
    /// Last service-call failure, surfaced via the controller's status
    /// snapshot per spec §4.3/§7. Never retried within the same tick; the
    /// next evaluation's pass simply overwrites or clears it.
    last_error: Mutex<Option<String>>,
}

impl Actuator {
    pub fn new(gateway: Arc<dyn PlatformGateway>, units: Vec<HvacUnitDescriptor>) -> Self {
        Self { gateway, units, last_error: Mutex::new(None) }
    }

    /// The most recent service-call failure recorded by the actuator, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Execute the entry action produced by a state-machine transition. A
    /// sensor-read failure for one unit skips that unit without failing the
    /// whole pass; a service-call failure is logged and surfaced via the
    /// caller's status snapshot, never retried within the same tick.
    pub async fn apply(&self, action: &EntryAction, heating: &HeatingParams, cooling: &CoolingParams) {
        match action {
            EntryAction::StartHeating | EntryAction::ResumeHeating => {
                self.per_unit_pass(UnitMode::Heating, heating, cooling).await;
            }
            EntryAction::StartCooling => {
                self.per_unit_pass(UnitMode::Cooling, heating, cooling).await;
            }
            EntryAction::StopAll | EntryAction::AbortDefrost => {
                self.stop_all().await;
            }
            EntryAction::RecordDefrostStart(_) => {
                // Heating output is released during defrost; the platform
                // manages the physical cycle independently.
                self.stop_all().await;
            }
            EntryAction::None | EntryAction::MergeContext | EntryAction::ApplyOverride(_) => {}
        }
    }

    async fn per_unit_pass(&self, mode: UnitMode, heating: &HeatingParams, cooling: &CoolingParams) {
        for unit in self.units.iter().filter(|u| u.enabled) {
            let Some(sensor_id) = unit.derived_sensor_id() else {
                tracing::warn!(entity_id = %unit.entity_id, "unit entity id missing domain separator, skipping");
                continue;
            };

            let room_temp = match self.gateway.get_state(&sensor_id).await {
                Ok(state) => match state.state.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::warn!(entity_id = %unit.entity_id, sensor_id = %sensor_id, "unparseable sensor reading, skipping unit");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(entity_id = %unit.entity_id, sensor_id = %sensor_id, error = %e, "sensor read failed, skipping unit");
                    continue;
                }
            };

            let command = match mode {
                UnitMode::Cooling => {
                    let t = &cooling.temperature_thresholds;
                    if room_temp > t.indoor_max {
                        Some(UnitCommand::On { mode: "cool", preset: &cooling.preset_mode, setpoint: cooling.temperature })
                    } else if room_temp < t.indoor_min {
                        Some(UnitCommand::Off)
                    } else {
                        None
                    }
                }
                UnitMode::Heating => {
                    let t = &heating.temperature_thresholds;
                    if room_temp < t.indoor_min {
                        Some(UnitCommand::On { mode: "heat", preset: &heating.preset_mode, setpoint: heating.temperature })
                    } else if room_temp > t.indoor_max {
                        Some(UnitCommand::Off)
                    } else {
                        None
                    }
                }
            };

            if let Some(command) = command {
                self.send_command(unit, command).await;
            }
        }
    }

    async fn stop_all(&self) {
        for unit in self.units.iter().filter(|u| u.enabled) {
            self.send_command(unit, UnitCommand::Off).await;
        }
    }

    async fn send_command(&self, unit: &HvacUnitDescriptor, command: UnitCommand<'_>) {
        let result = match command {
            UnitCommand::On { mode, preset, setpoint } => {
                if let Err(e) = self
                    .gateway
                    .control_entity(&unit.entity_id, "climate", "set_hvac_mode", "hvac_mode", mode)
                    .await
                {
                    Err(e)
                } else if let Err(e) = self
                    .gateway
                    .control_entity(&unit.entity_id, "climate", "set_preset_mode", "preset_mode", preset)
                    .await
                {
                    Err(e)
                } else {
                    self.gateway
                        .control_entity(
                            &unit.entity_id,
                            "climate",
                            "set_temperature",
                            "temperature",
                            &setpoint.to_string(),
                        )
                        .await
                }
            }
            UnitCommand::Off => {
                self.gateway
                    .control_entity(&unit.entity_id, "climate", "set_hvac_mode", "hvac_mode", "off")
                    .await
            }
        };

        if let Err(e) = result {
            tracing::warn!(entity_id = %unit.entity_id, error = %e, "service call failed, will reconsider next evaluation");
            *self.last_error.lock().unwrap() = Some(format!("{}: {e}", unit.entity_id));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum UnitMode {
    Heating,
    Cooling,
}

enum UnitCommand<'a> {
    On { mode: &'static str, preset: &'a str, setpoint: f64 },
    Off,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemperatureThresholds;
    use crate::gateway::{DryRunGateway, EntityState};
    use std::collections::HashMap;

    fn heating() -> HeatingParams {
        HeatingParams {
            temperature: 21.0,
            preset_mode: "comfort".into(),
            temperature_thresholds: TemperatureThresholds {
                indoor_min: 19.0,
                indoor_max: 22.0,
                outdoor_min: -10.0,
                outdoor_max: 15.0,
            },
            defrost: None,
        }
    }

    fn cooling() -> CoolingParams {
        CoolingParams {
            temperature: 24.0,
            preset_mode: "comfort".into(),
            temperature_thresholds: TemperatureThresholds {
                indoor_min: 23.0,
                indoor_max: 26.0,
                outdoor_min: 10.0,
                outdoor_max: 45.0,
            },
        }
    }

    fn unit(name: &str) -> HvacUnitDescriptor {
        HvacUnitDescriptor { entity_id: format!("climate.{name}"), enabled: true, defrost: false }
    }

    #[tokio::test]
    async fn scenario_6_per_unit_policy_on_and_off() {
        let gateway = Arc::new(DryRunGateway::new());
        gateway
            .seed_state("sensor.living_room_temperature", EntityState { state: "27.0".into(), attributes: HashMap::new() })
            .await;
        gateway
            .seed_state("sensor.bedroom_temperature", EntityState { state: "22.5".into(), attributes: HashMap::new() })
            .await;

        let actuator = Actuator::new(gateway.clone(), vec![unit("living_room"), unit("bedroom")]);
        actuator.apply(&EntryAction::StartCooling, &heating(), &cooling()).await;

        let calls = gateway.calls().await;
        assert!(calls.iter().any(|c| c.entity_id == "climate.living_room" && c.value == "cool"));
        assert!(calls.iter().any(|c| c.entity_id == "climate.bedroom" && c.value == "off"));
    }

    #[tokio::test]
    async fn unit_in_dead_band_left_untouched() {
        let gateway = Arc::new(DryRunGateway::new());
        gateway
            .seed_state("sensor.living_room_temperature", EntityState { state: "24.5".into(), attributes: HashMap::new() })
            .await;

        let actuator = Actuator::new(gateway.clone(), vec![unit("living_room")]);
        actuator.apply(&EntryAction::StartCooling, &heating(), &cooling()).await;

        let calls = gateway.calls().await;
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn sensor_read_failure_skips_unit_without_failing_pass() {
        let gateway = Arc::new(DryRunGateway::new());
        // No seeded state for "missing_unit" -> get_state returns EntityNotFoundError.
        gateway
            .seed_state("sensor.present_unit_temperature", EntityState { state: "27.0".into(), attributes: HashMap::new() })
            .await;

        let actuator =
            Actuator::new(gateway.clone(), vec![unit("missing_unit"), unit("present_unit")]);
        actuator.apply(&EntryAction::StartCooling, &heating(), &cooling()).await;

        let calls = gateway.calls().await;
        assert_eq!(calls.len(), 3); // mode + preset + temperature for the one readable unit
        assert!(calls.iter().all(|c| c.entity_id == "climate.present_unit"));
    }

    #[tokio::test]
    async fn stop_all_turns_off_every_enabled_unit() {
        let gateway = Arc::new(DryRunGateway::new());
        let actuator = Actuator::new(
            gateway.clone(),
            vec![unit("living_room"), unit("bedroom")],
        );
        actuator.apply(&EntryAction::StopAll, &heating(), &cooling()).await;

        let calls = gateway.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.value == "off"));
    }

    /// Gateway double whose every service call fails, for exercising the
    /// "service-call failure is recorded and surfaced via the status
    /// snapshot" requirement of spec §4.3/§7.
    struct FailingGateway;

    #[async_trait::async_trait]
    impl crate::gateway::PlatformGateway for FailingGateway {
        async fn connect(&self) -> Result<(), crate::error::HagError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), crate::error::HagError> {
            Ok(())
        }
        async fn get_state(&self, _entity_id: &str) -> Result<crate::gateway::EntityState, crate::error::HagError> {
            Ok(crate::gateway::EntityState { state: "27.0".into(), attributes: HashMap::new() })
        }
        async fn subscribe_state_changed(
            &self,
            _handler: crate::gateway::StateChangeHandler,
        ) -> Result<(), crate::error::HagError> {
            Ok(())
        }
        async fn call_service(
            &self,
            _domain: &str,
            _service: &str,
            _data: serde_json::Value,
        ) -> Result<(), crate::error::HagError> {
            Err(crate::error::HagError::ServiceCall("simulated failure".into()))
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn service_call_failure_recorded_without_failing_the_pass() {
        let actuator = Actuator::new(Arc::new(FailingGateway), vec![unit("living_room"), unit("bedroom")]);
        assert!(actuator.last_error().is_none());

        actuator.apply(&EntryAction::StartCooling, &heating(), &cooling()).await;

        let err = actuator.last_error().expect("expected a recorded service-call failure");
        assert!(err.contains("climate."));
    }
}
