use chrono::{NaiveDateTime, Timelike, Utc};

/// Source of the timestamps written by maintenance, truncated to seconds.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        truncate_to_seconds(Utc::now().naive_utc())
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        truncate_to_seconds(self.0)
    }
}

pub fn truncate_to_seconds(t: NaiveDateTime) -> NaiveDateTime {
    t.with_nanosecond(0).unwrap_or(t)
}
