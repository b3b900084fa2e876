use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Utc};
use std::sync::Mutex;

/// Source of wall-clock time for schedule evaluation and auth throttling.
pub trait Clock: Send + Sync {
    /// Local wall-clock time, used for daily windows.
    fn now_local(&self) -> NaiveDateTime;

    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests. Local and UTC time are the same instant.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: NaiveDateTime) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now_local(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.now_local().and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn manual_clock_advances() {
        let start = NaiveDate::from_ymd_opt(2024, 12, 12)
            .unwrap()
            .and_hms_opt(21, 59, 0)
            .unwrap();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::minutes(2));
        assert_eq!(clock.now_local(), start + TimeDelta::minutes(2));
        assert_eq!(clock.now_utc().naive_utc(), clock.now_local());
    }
}
