//! Finite state machine: states, events, guards, and the defrost cycle. See
//! spec §4.2. The state machine is deliberately synchronous and owns no I/O:
//! it emits [`EntryAction`]s that the controller loop executes against the
//! [`crate::actuator::Actuator`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::{HvacOptions, SystemMode};
use crate::error::{HagError, StateError};
use crate::evaluation::{DecisionEngine, EvaluationResult, StateChangeData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HvacState {
    Idle,
    Evaluating,
    Off,
    Heating,
    Cooling,
    Defrosting,
    ManualOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    Heat,
    Cool,
    Off,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManualOverrideRequest {
    pub mode: OverrideMode,
    pub target_temp: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct DefrostTimer {
    pub started_at: DateTime<Utc>,
    pub duration: StdDuration,
    pub period: StdDuration,
}

#[derive(Debug, Clone)]
pub enum HvacEvent {
    AutoEvaluate,
    UpdateTemperatures { indoor: Option<f64>, outdoor: Option<f64> },
    UpdateConditions { hour: Option<u8>, is_weekday: Option<bool> },
    Heat,
    Cool,
    Off,
    DefrostNeeded,
    DefrostComplete,
    ManualOverride(ManualOverrideRequest),
}

/// Mutable context merged in place by the state machine's single-writer
/// discipline. Non-finite temperature updates are rejected before they reach
/// this struct (see [`HvacStateMachine::handle_event`]).
#[derive(Debug, Clone)]
pub struct HvacContext {
    pub indoor_temp: Option<f64>,
    pub outdoor_temp: Option<f64>,
    pub current_hour: u8,
    pub is_weekday: bool,
    pub system_mode: SystemMode,
    pub manual_override: Option<ManualOverrideRequest>,
}

impl HvacContext {
    pub fn new(system_mode: SystemMode, hour: u8, is_weekday: bool) -> Self {
        Self {
            indoor_temp: None,
            outdoor_temp: None,
            current_hour: hour,
            is_weekday,
            system_mode,
            manual_override: None,
        }
    }

    fn state_change_data(&self) -> Option<StateChangeData> {
        Some(StateChangeData {
            current_temp: self.indoor_temp?,
            weather_temp: self.outdoor_temp?,
            hour: self.current_hour,
            is_weekday: self.is_weekday,
        })
    }
}

/// Action a transition requires the controller to carry out against the
/// actuator. The state machine never performs I/O itself.
#[derive(Debug, Clone)]
pub enum EntryAction {
    None,
    MergeContext,
    StartHeating,
    StartCooling,
    StopAll,
    RecordDefrostStart(DefrostTimer),
    ResumeHeating,
    ApplyOverride(ManualOverrideRequest),
    AbortDefrost,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: HvacState,
    pub to: HvacState,
    pub action: EntryAction,
}

pub struct HvacStateMachine {
    state: HvacState,
    running: bool,
    context: HvacContext,
    config: Arc<HvacOptions>,
    decision_engine: Arc<dyn DecisionEngine>,
    clock: Arc<dyn Clock>,
    last_defrost: Option<DateTime<Utc>>,
    defrost_timer: Option<DefrostTimer>,
    warned_overlap: bool,
}

impl HvacStateMachine {
    pub fn new(
        config: Arc<HvacOptions>,
        decision_engine: Arc<dyn DecisionEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let system_mode = config.system_mode;
        let hour = clock.hour();
        let is_weekday = clock.is_weekday();
        Self {
            state: HvacState::Idle,
            running: false,
            context: HvacContext::new(system_mode, hour, is_weekday),
            config,
            decision_engine,
            clock,
            last_defrost: None,
            defrost_timer: None,
            warned_overlap: false,
        }
    }

    pub fn start(&mut self) -> Result<(), HagError> {
        if self.running {
            return Err(HagError::State(StateError::AlreadyRunning));
        }
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn state(&self) -> HvacState {
        self.state
    }

    pub fn context(&self) -> &HvacContext {
        &self.context
    }

    pub fn last_defrost(&self) -> Option<DateTime<Utc>> {
        self.last_defrost
    }

    fn evaluate(&self) -> Option<EvaluationResult> {
        let data = self.context.state_change_data()?;
        Some(
            self.decision_engine
                .evaluate(&self.config, data, self.last_defrost, self.clock.now()),
        )
    }

    /// Public read-only evaluation of the current context, used by the
    /// controller loop to decide whether to dispatch a `DEFROST_NEEDED`
    /// event while in `heating` (see spec §4.2's `canDefrost` guard and the
    /// controller's periodic defrost check).
    pub fn current_evaluation(&self) -> Option<EvaluationResult> {
        self.evaluate()
    }

    fn can_heat(&self) -> bool {
        if matches!(self.context.system_mode, SystemMode::CoolOnly | SystemMode::Off) {
            return false;
        }
        self.evaluate().is_some_and(|r| r.should_heat)
    }

    fn can_cool(&self) -> bool {
        if matches!(self.context.system_mode, SystemMode::HeatOnly | SystemMode::Off) {
            return false;
        }
        self.evaluate().is_some_and(|r| r.should_cool)
    }

    fn can_defrost(&self) -> bool {
        self.evaluate().is_some_and(|r| r.needs_defrost)
    }

    fn should_auto_heat(&self) -> bool {
        self.context.system_mode == SystemMode::Auto && self.can_heat()
    }

    fn should_auto_cool(&self) -> bool {
        self.context.system_mode == SystemMode::Auto && self.can_cool()
    }

    fn warn_if_thresholds_overlap(&mut self) {
        if self.warned_overlap {
            return;
        }
        let h = &self.config.heating.temperature_thresholds;
        let c = &self.config.cooling.temperature_thresholds;
        if h.indoor_max > c.indoor_min {
            tracing::warn!(
                heating_indoor_max = h.indoor_max,
                cooling_indoor_min = c.indoor_min,
                "heating and cooling thresholds overlap; heating takes priority on tie"
            );
            self.warned_overlap = true;
        }
    }

    fn start_defrost_timer(&mut self) -> DefrostTimer {
        let defrost = self
            .config
            .heating
            .defrost
            .expect("can_defrost guard implies defrost config is present");
        let now = self.clock.now();
        let timer = DefrostTimer {
            started_at: now,
            duration: StdDuration::from_secs(defrost.duration_seconds),
            period: StdDuration::from_secs(defrost.period_seconds),
        };
        self.last_defrost = Some(now);
        self.defrost_timer = Some(timer);
        timer
    }

    /// Process one event. Events delivered to a stopped machine fail with
    /// `StateError::NotRunning`. `UpdateTemperatures` with a non-finite value
    /// is silently dropped (§4.2 failure semantics) and the prior context
    /// preserved.
    pub fn handle_event(&mut self, event: HvacEvent) -> Result<Transition, HagError> {
        if !self.running {
            return Err(HagError::State(StateError::NotRunning));
        }

        match event {
            HvacEvent::UpdateTemperatures { indoor, outdoor } => {
                if let Some(v) = indoor {
                    if v.is_finite() {
                        self.context.indoor_temp = Some(v);
                    } else {
                        tracing::debug!(value = v, "dropping non-finite indoor temperature update");
                    }
                }
                if let Some(v) = outdoor {
                    if v.is_finite() {
                        self.context.outdoor_temp = Some(v);
                    } else {
                        tracing::debug!(value = v, "dropping non-finite outdoor temperature update");
                    }
                }
                Ok(Transition { from: self.state, to: self.state, action: EntryAction::MergeContext })
            }
            HvacEvent::UpdateConditions { hour, is_weekday } => {
                if let Some(h) = hour {
                    self.context.current_hour = h;
                }
                if let Some(w) = is_weekday {
                    self.context.is_weekday = w;
                }
                Ok(Transition { from: self.state, to: self.state, action: EntryAction::MergeContext })
            }
            HvacEvent::AutoEvaluate => self.handle_auto_evaluate(),
            HvacEvent::Heat => self.handle_heat(),
            HvacEvent::Cool => self.handle_cool(),
            HvacEvent::Off => self.handle_off(),
            HvacEvent::DefrostNeeded => self.handle_defrost_needed(),
            HvacEvent::DefrostComplete => self.handle_defrost_complete(),
            HvacEvent::ManualOverride(req) => self.handle_manual_override(req),
        }
    }

    fn transition(&mut self, to: HvacState, action: EntryAction) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to, action }
    }

    fn handle_auto_evaluate(&mut self) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Idle | HvacState::Off => {
                Ok(self.transition(HvacState::Evaluating, EntryAction::None))
            }
            HvacState::Evaluating => {
                self.warn_if_thresholds_overlap();
                if self.should_auto_heat() {
                    Ok(self.transition(HvacState::Heating, EntryAction::StartHeating))
                } else if self.should_auto_cool() {
                    Ok(self.transition(HvacState::Cooling, EntryAction::StartCooling))
                } else {
                    Ok(self.transition(HvacState::Off, EntryAction::StopAll))
                }
            }
            HvacState::Heating | HvacState::Cooling => {
                Ok(self.transition(HvacState::Evaluating, EntryAction::None))
            }
            HvacState::ManualOverride => {
                self.context.manual_override = None;
                Ok(self.transition(HvacState::Evaluating, EntryAction::None))
            }
            HvacState::Defrosting => Ok(self.transition(self.state, EntryAction::None)),
        }
    }

    fn handle_heat(&mut self) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Idle | HvacState::Off if self.can_heat() => {
                Ok(self.transition(HvacState::Heating, EntryAction::StartHeating))
            }
            HvacState::Cooling if self.can_heat() => {
                Ok(self.transition(HvacState::Heating, EntryAction::StartHeating))
            }
            _ => Ok(self.transition(self.state, EntryAction::None)),
        }
    }

    fn handle_cool(&mut self) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Idle | HvacState::Off if self.can_cool() => {
                Ok(self.transition(HvacState::Cooling, EntryAction::StartCooling))
            }
            HvacState::Heating if self.can_cool() => {
                Ok(self.transition(HvacState::Cooling, EntryAction::StartCooling))
            }
            _ => Ok(self.transition(self.state, EntryAction::None)),
        }
    }

    fn handle_off(&mut self) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Heating | HvacState::Cooling => {
                Ok(self.transition(HvacState::Idle, EntryAction::StopAll))
            }
            HvacState::Defrosting => {
                self.defrost_timer = None;
                Ok(self.transition(HvacState::Idle, EntryAction::AbortDefrost))
            }
            _ => Ok(self.transition(self.state, EntryAction::None)),
        }
    }

    fn handle_defrost_needed(&mut self) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Heating if self.can_defrost() => {
                let timer = self.start_defrost_timer();
                Ok(self.transition(HvacState::Defrosting, EntryAction::RecordDefrostStart(timer)))
            }
            _ => Ok(self.transition(self.state, EntryAction::None)),
        }
    }

    fn handle_defrost_complete(&mut self) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Defrosting => {
                self.defrost_timer = None;
                Ok(self.transition(HvacState::Heating, EntryAction::ResumeHeating))
            }
            _ => Ok(self.transition(self.state, EntryAction::None)),
        }
    }

    fn handle_manual_override(&mut self, req: ManualOverrideRequest) -> Result<Transition, HagError> {
        match self.state {
            HvacState::Defrosting => {
                self.defrost_timer = None;
                self.context.manual_override = Some(req);
                Ok(self.transition(HvacState::ManualOverride, EntryAction::ApplyOverride(req)))
            }
            _ => {
                self.context.manual_override = Some(req);
                Ok(self.transition(HvacState::ManualOverride, EntryAction::ApplyOverride(req)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{CoolingParams, DefrostParams, HeatingParams, TemperatureThresholds};
    use crate::evaluation::RuleBasedEngine;
    use chrono::TimeZone;

    fn options(mode: SystemMode) -> Arc<HvacOptions> {
        Arc::new(HvacOptions {
            temp_sensor: "sensor.indoor_temperature".into(),
            outdoor_sensor: "sensor.outdoor_temperature".into(),
            system_mode: mode,
            hvac_entities: vec![],
            heating: HeatingParams {
                temperature: 21.0,
                preset_mode: "comfort".into(),
                temperature_thresholds: TemperatureThresholds {
                    indoor_min: 19.0,
                    indoor_max: 22.0,
                    outdoor_min: -10.0,
                    outdoor_max: 15.0,
                },
                defrost: Some(DefrostParams {
                    temperature_threshold: 0.0,
                    period_seconds: 3600,
                    duration_seconds: 300,
                }),
            },
            cooling: CoolingParams {
                temperature: 24.0,
                preset_mode: "comfort".into(),
                temperature_thresholds: TemperatureThresholds {
                    indoor_min: 23.0,
                    indoor_max: 26.0,
                    outdoor_min: 10.0,
                    outdoor_max: 45.0,
                },
            },
            active_hours: None,
            evaluation_cache_ms: 100,
        })
    }

    fn machine(mode: SystemMode) -> HvacStateMachine {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 7, 20, 10, 0, 0).unwrap()));
        let mut m = HvacStateMachine::new(options(mode), Arc::new(RuleBasedEngine), clock);
        m.start().unwrap();
        m
    }

    #[test]
    fn event_to_stopped_machine_fails() {
        let mut m = machine(SystemMode::Auto);
        m.stop();
        let err = m.handle_event(HvacEvent::AutoEvaluate).unwrap_err();
        assert!(matches!(err, HagError::State(StateError::NotRunning)));
    }

    #[test]
    fn starting_twice_fails() {
        let mut m = machine(SystemMode::Auto);
        assert!(matches!(
            m.start().unwrap_err(),
            HagError::State(StateError::AlreadyRunning)
        ));
    }

    #[test]
    fn full_cycle_idle_to_heating() {
        let mut m = machine(SystemMode::Auto);
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(18.0), outdoor: Some(5.0) })
            .unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap(); // idle -> evaluating
        assert_eq!(m.state(), HvacState::Evaluating);
        let t = m.handle_event(HvacEvent::AutoEvaluate).unwrap(); // evaluating -> heating
        assert_eq!(m.state(), HvacState::Heating);
        assert!(matches!(t.action, EntryAction::StartHeating));
    }

    #[test]
    fn scenario_4_heat_only_mode_goes_off_when_cooling_would_trigger() {
        let mut m = machine(SystemMode::HeatOnly);
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(27.0), outdoor: Some(30.0) })
            .unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        let t = m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        assert_eq!(m.state(), HvacState::Off);
        assert!(matches!(t.action, EntryAction::StopAll));
    }

    #[test]
    fn system_mode_restriction_cool_only_never_heats() {
        let mut m = machine(SystemMode::CoolOnly);
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(10.0), outdoor: Some(5.0) })
            .unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        assert_ne!(m.state(), HvacState::Heating);
    }

    #[test]
    fn system_mode_off_never_heats_or_cools() {
        let mut m = machine(SystemMode::Off);
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(10.0), outdoor: Some(5.0) })
            .unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        assert_eq!(m.state(), HvacState::Off);
    }

    #[test]
    fn non_finite_temperature_update_is_dropped() {
        let mut m = machine(SystemMode::Auto);
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(18.0), outdoor: Some(5.0) })
            .unwrap();
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(f64::NAN), outdoor: None })
            .unwrap();
        assert_eq!(m.context().indoor_temp, Some(18.0));
    }

    #[test]
    fn defrost_cycle_resumes_heating_on_complete() {
        let mut m = machine(SystemMode::Auto);
        m.handle_event(HvacEvent::UpdateTemperatures { indoor: Some(18.0), outdoor: Some(-5.0) })
            .unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        assert_eq!(m.state(), HvacState::Heating);

        let t = m.handle_event(HvacEvent::DefrostNeeded).unwrap();
        assert_eq!(m.state(), HvacState::Defrosting);
        assert!(matches!(t.action, EntryAction::RecordDefrostStart(_)));

        let t = m.handle_event(HvacEvent::DefrostComplete).unwrap();
        assert_eq!(m.state(), HvacState::Heating);
        assert!(matches!(t.action, EntryAction::ResumeHeating));
    }

    #[test]
    fn manual_override_clears_on_auto_evaluate() {
        let mut m = machine(SystemMode::Auto);
        m.handle_event(HvacEvent::ManualOverride(ManualOverrideRequest {
            mode: OverrideMode::Heat,
            target_temp: Some(21.0),
            expires_at: None,
        }))
        .unwrap();
        assert_eq!(m.state(), HvacState::ManualOverride);
        m.handle_event(HvacEvent::AutoEvaluate).unwrap();
        assert_eq!(m.state(), HvacState::Evaluating);
        assert!(m.context().manual_override.is_none());
    }
}
