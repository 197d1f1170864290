use std::sync::Arc;

use chrono::{Duration, Local, NaiveDateTime};
use parking_lot::Mutex;

/// Device-local wall clock. No time zone other than the device's own is modelled.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Settable clock shared between a service and whoever drives it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, instant: NaiveDateTime) {
        *self.now.lock() = instant;
    }

    pub fn advance(&self, by: Duration) -> NaiveDateTime {
        let mut now = self.now.lock();
        *now += by;
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}
