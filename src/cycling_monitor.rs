//! Bounded ring buffer of state-change records and cycling-health
//! classification. See spec §4.6. Single-writer (the controller loop's
//! transition hook), multi-reader (status snapshot); readers get a copy.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::state_machine::HvacState;

const CAPACITY: usize = 100;
const RAPID_CYCLE_WINDOW_MINUTES: i64 = 15;
const RAPID_CYCLE_CRITICAL_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub from_state: HvacState,
    pub to_state: HvacState,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RapidCyclingAlert {
    pub severity: AlertSeverity,
    pub elapsed_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclingHealth {
    InsufficientData,
    Critical,
    Warning,
    Info,
    Healthy,
}

/// Fixed-capacity ring buffer of the last [`CAPACITY`] state changes.
pub struct CyclingMonitor {
    records: VecDeque<StateChangeRecord>,
}

impl Default for CyclingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CyclingMonitor {
    pub fn new() -> Self {
        Self { records: VecDeque::with_capacity(CAPACITY) }
    }

    /// Record a transition, evicting the oldest entry once at capacity, and
    /// check the trailing three records for a rapid-cycling pattern.
    pub fn record(&mut self, record: StateChangeRecord) -> Option<RapidCyclingAlert> {
        if self.records.len() == CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
        let alert = self.check_rapid_cycling();
        if let Some(alert) = alert {
            match alert.severity {
                AlertSeverity::Critical => tracing::error!(
                    elapsed_minutes = alert.elapsed_minutes,
                    "rapid cycling detected: CRITICAL"
                ),
                AlertSeverity::Warning => tracing::warn!(
                    elapsed_minutes = alert.elapsed_minutes,
                    "rapid cycling detected: WARNING"
                ),
            }
        }
        alert
    }

    /// Pattern `X -> HEAT -> OFF -> HEAT` over the trailing three records,
    /// i.e. three consecutive transitions: into heating, out of heating, and
    /// back into heating. Fires when the total span is under 15 minutes;
    /// severity is CRITICAL when the off period itself (the middle record's
    /// span) is under 5 minutes, else WARNING.
    fn check_rapid_cycling(&self) -> Option<RapidCyclingAlert> {
        if self.records.len() < 3 {
            return None;
        }
        let n = self.records.len();
        let first = self.records[n - 3];
        let second = self.records[n - 2];
        let third = self.records[n - 1];

        let is_pattern = first.to_state == HvacState::Heating
            && second.from_state == HvacState::Heating
            && second.to_state == HvacState::Off
            && third.from_state == HvacState::Off
            && third.to_state == HvacState::Heating;
        if !is_pattern {
            return None;
        }

        let total_elapsed = third.timestamp - first.timestamp;
        if total_elapsed > Duration::minutes(RAPID_CYCLE_WINDOW_MINUTES) {
            return None;
        }

        let off_duration = third.timestamp - second.timestamp;
        let severity = if off_duration <= Duration::minutes(RAPID_CYCLE_CRITICAL_MINUTES) {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        Some(RapidCyclingAlert { severity, elapsed_minutes: total_elapsed.num_minutes() })
    }

    /// Classify overall cycling health over the trailing 24 hours of
    /// records, based on the average interval between HEAT entries.
    pub fn health(&self, now: DateTime<Utc>) -> CyclingHealth {
        let window_start = now - Duration::hours(24);
        let recent: Vec<&StateChangeRecord> =
            self.records.iter().filter(|r| r.timestamp >= window_start).collect();

        if recent.len() < 2 {
            return CyclingHealth::InsufficientData;
        }

        let heat_entries: Vec<DateTime<Utc>> = recent
            .iter()
            .filter(|r| r.to_state == HvacState::Heating)
            .map(|r| r.timestamp)
            .collect();

        if heat_entries.len() < 2 {
            return CyclingHealth::InsufficientData;
        }

        let mut total_minutes = 0i64;
        for pair in heat_entries.windows(2) {
            total_minutes += (pair[1] - pair[0]).num_minutes();
        }
        let average = total_minutes / (heat_entries.len() as i64 - 1);

        if average < 15 {
            CyclingHealth::Critical
        } else if average < 30 {
            CyclingHealth::Warning
        } else if average > 120 {
            CyclingHealth::Info
        } else {
            CyclingHealth::Healthy
        }
    }

    /// Read-only copy of the ring buffer contents, oldest first.
    pub fn records(&self) -> Vec<StateChangeRecord> {
        self.records.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
