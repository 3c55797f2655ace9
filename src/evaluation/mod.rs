//! Pure evaluation engine: decides what the HVAC *should* be doing given a
//! snapshot, with no side effects. See spec §4.1.

pub mod cache;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::config::HvacOptions;

/// Snapshot of the inputs consumed by a single evaluation. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateChangeData {
    pub current_temp: f64,
    pub weather_temp: f64,
    pub hour: u8,
    pub is_weekday: bool,
}

/// Human-readable (and log-structured) reason for the evaluation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationReason {
    HeatingIndoorBelowMin,
    HeatingOutdoorOutOfRange,
    HeatingOutsideActiveHours,
    HeatingSatisfied,
    CoolingIndoorAboveMax,
    CoolingOutdoorOutOfRange,
    CoolingOutsideActiveHours,
    CoolingSatisfied,
    Idle,
}

impl fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvaluationReason::HeatingIndoorBelowMin => "indoor temperature below heating minimum",
            EvaluationReason::HeatingOutdoorOutOfRange => "outdoor temperature outside heating range",
            EvaluationReason::HeatingOutsideActiveHours => "outside active hours for heating",
            EvaluationReason::HeatingSatisfied => "heating setpoint satisfied",
            EvaluationReason::CoolingIndoorAboveMax => "indoor temperature above cooling maximum",
            EvaluationReason::CoolingOutdoorOutOfRange => "outdoor temperature outside cooling range",
            EvaluationReason::CoolingOutsideActiveHours => "outside active hours for cooling",
            EvaluationReason::CoolingSatisfied => "cooling setpoint satisfied",
            EvaluationReason::Idle => "no heating or cooling required",
        };
        f.write_str(s)
    }
}

/// Output of a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationResult {
    pub should_heat: bool,
    pub should_cool: bool,
    pub needs_defrost: bool,
    pub reason: EvaluationReason,
}

/// Pluggable decision seam (§1, §9 design notes): the built-in rule-based
/// engine is the only implementation shipped, but an alternative policy with
/// the same contract could be substituted without touching the state
/// machine.
pub trait DecisionEngine: Send + Sync {
    fn evaluate(
        &self,
        config: &HvacOptions,
        data: StateChangeData,
        last_defrost: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EvaluationResult;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedEngine;

impl DecisionEngine for RuleBasedEngine {
    fn evaluate(
        &self,
        config: &HvacOptions,
        data: StateChangeData,
        last_defrost: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        evaluate(config, data, last_defrost, now)
    }
}

/// Whether the current hour falls within the configured active-hours window.
/// Passes unconditionally when no active-hours configuration is present.
fn within_active_hours(config: &HvacOptions, data: StateChangeData) -> bool {
    match &config.active_hours {
        Some(hours) => hours.contains(data.hour, data.is_weekday),
        None => true,
    }
}

fn evaluate_heating(config: &HvacOptions, data: StateChangeData) -> (bool, EvaluationReason) {
    let thresholds = &config.heating.temperature_thresholds;

    if data.current_temp >= thresholds.indoor_min {
        return (false, EvaluationReason::HeatingSatisfied);
    }
    if !(thresholds.outdoor_min <= data.weather_temp && data.weather_temp <= thresholds.outdoor_max)
    {
        return (false, EvaluationReason::HeatingOutdoorOutOfRange);
    }
    if !within_active_hours(config, data) {
        return (false, EvaluationReason::HeatingOutsideActiveHours);
    }
    (true, EvaluationReason::HeatingIndoorBelowMin)
}

fn evaluate_cooling(config: &HvacOptions, data: StateChangeData) -> (bool, EvaluationReason) {
    let thresholds = &config.cooling.temperature_thresholds;

    if data.current_temp <= thresholds.indoor_max {
        return (false, EvaluationReason::CoolingSatisfied);
    }
    if !(thresholds.outdoor_min <= data.weather_temp && data.weather_temp <= thresholds.outdoor_max)
    {
        return (false, EvaluationReason::CoolingOutdoorOutOfRange);
    }
    if !within_active_hours(config, data) {
        return (false, EvaluationReason::CoolingOutsideActiveHours);
    }
    (true, EvaluationReason::CoolingIndoorAboveMax)
}

fn evaluate_defrost(
    config: &HvacOptions,
    data: StateChangeData,
    last_defrost: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(defrost) = &config.heating.defrost else {
        return false;
    };
    if data.weather_temp >= defrost.temperature_threshold {
        return false;
    }
    match last_defrost {
        None => true,
        Some(last) => {
            let elapsed = (now - last).num_seconds();
            elapsed >= defrost.period_seconds as i64
        }
    }
}

/// Pure function over the declared input domain: heating rule, cooling rule,
/// and defrost rule exactly as spec §4.1. Heating is evaluated before cooling
/// so a misconfigured overlap (heating.indoorMax > cooling.indoorMin) resolves
/// in heating's favor; see `crate::state_machine` for the one-shot warning log
/// that flags such a misconfiguration.
pub fn evaluate(
    config: &HvacOptions,
    data: StateChangeData,
    last_defrost: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> EvaluationResult {
    let (should_heat, heat_reason) = evaluate_heating(config, data);
    let (should_cool, cool_reason) = evaluate_cooling(config, data);
    let needs_defrost = evaluate_defrost(config, data, last_defrost, now);

    let reason = if should_heat {
        heat_reason
    } else if should_cool {
        cool_reason
    } else if heat_reason != EvaluationReason::HeatingSatisfied {
        heat_reason
    } else if cool_reason != EvaluationReason::CoolingSatisfied {
        cool_reason
    } else {
        EvaluationReason::Idle
    };

    EvaluationResult {
        should_heat,
        should_cool,
        needs_defrost,
        reason,
    }
}
