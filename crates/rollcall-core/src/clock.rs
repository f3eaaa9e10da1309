use chrono::{Local, NaiveDateTime};
use std::sync::{Mutex, PoisonError};

/// Ledger date column format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Ledger time column format.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Source of the local wall-clock time used to stamp attendance.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> String {
        self.now().format(DATE_FORMAT).to_string()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
pub struct FixedClock(Mutex<NaiveDateTime>);

impl FixedClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
