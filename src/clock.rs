use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

/// Abstracts wall time so evaluation and the state machine stay deterministically
/// testable. Per the design notes, the "global mutable current time" pattern is
/// replaced with an injectable interface.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn hour(&self) -> u8 {
        self.now().hour() as u8
    }

    fn is_weekday(&self) -> bool {
        !matches!(self.now().weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_reports_injected_time() {
        let dt = Utc.with_ymd_and_hms(2026, 7, 20, 10, 0, 0).unwrap(); // Monday
        let clock = FixedClock(dt);
        assert_eq!(clock.hour(), 10);
        assert!(clock.is_weekday());
    }

    #[test]
    fn fixed_clock_detects_weekend() {
        let dt = Utc.with_ymd_and_hms(2026, 7, 25, 10, 0, 0).unwrap(); // Saturday
        let clock = FixedClock(dt);
        assert!(!clock.is_weekday());
    }
}
