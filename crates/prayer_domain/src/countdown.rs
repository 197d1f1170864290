use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::prayer::OccurrenceKey;
use crate::resolver::ResolvedNextPrayer;
use crate::tracking::{Subsystem, Trackers};

pub const ARRIVED_DISPLAY: &str = "0m 0s";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountdownFrame {
    pub display: String,
    /// 0.0 ..= 1.0
    pub progress: f64,
    pub is_final_hour: bool,
    pub arrived: bool,
}

impl CountdownFrame {
    fn arrived() -> Self {
        Self {
            display: ARRIVED_DISPLAY.to_string(),
            progress: 1.0,
            is_final_hour: true,
            arrived: true,
        }
    }
}

/// One countdown frame with the default one-hour final window and six-hour
/// nominal gap.
pub fn tick(
    next: &ResolvedNextPrayer,
    last_prayer_instant: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> CountdownFrame {
    tick_with(
        next,
        last_prayer_instant,
        now,
        Duration::hours(1),
        Duration::hours(6),
    )
}

// The final-hour ratio and the long-range ratio are independent formulas and
// do not meet at the one-hour boundary.
pub fn tick_with(
    next: &ResolvedNextPrayer,
    last_prayer_instant: Option<NaiveDateTime>,
    now: NaiveDateTime,
    final_hour: Duration,
    nominal_interval: Duration,
) -> CountdownFrame {
    if now >= next.instant {
        return CountdownFrame::arrived();
    }

    let remaining = (next.instant - now).num_seconds();
    let window = final_hour.num_seconds().max(1);

    if remaining <= window {
        return CountdownFrame {
            display: format!("{}m {}s", remaining / 60, remaining % 60),
            progress: ratio((window - remaining) as f64, window as f64),
            is_final_hour: true,
            arrived: false,
        };
    }

    let progress = match last_prayer_instant.filter(|last| *last < next.instant) {
        Some(last) => ratio(
            (now - last).num_seconds() as f64,
            (next.instant - last).num_seconds() as f64,
        ),
        None => {
            let nominal = nominal_interval.num_seconds().max(1) as f64;
            1.0 - ratio(remaining as f64, nominal)
        }
    };

    CountdownFrame {
        display: format!("{}h {}m", remaining / 3600, (remaining % 3600) / 60),
        progress,
        is_final_hour: false,
        arrived: false,
    }
}

fn ratio(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        return 1.0;
    }
    (part / whole).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CountdownUpdate {
    Running(CountdownFrame),
    /// The prayer instant has passed. `first` is true on the first tick that
    /// observed it; `held_for` is how long the zero state has been shown.
    Arrived {
        key: OccurrenceKey,
        frame: CountdownFrame,
        first: bool,
        held_for: Duration,
    },
}

/// Per-second countdown with arrived-once dedup.
#[derive(Debug, Clone)]
pub struct CountdownEngine {
    final_hour: Duration,
    nominal_interval: Duration,
    current: Option<OccurrenceKey>,
    arrived_since: Option<NaiveDateTime>,
    last_frame: Option<CountdownFrame>,
}

impl CountdownEngine {
    pub fn new(final_hour: Duration, nominal_interval: Duration) -> Self {
        Self {
            final_hour,
            nominal_interval,
            current: None,
            arrived_since: None,
            last_frame: None,
        }
    }

    pub fn tick(
        &mut self,
        next: &ResolvedNextPrayer,
        last_prayer_instant: Option<NaiveDateTime>,
        now: NaiveDateTime,
        trackers: &mut Trackers,
    ) -> CountdownUpdate {
        let key = next.key();
        if self.current != Some(key) {
            self.current = Some(key);
            self.arrived_since = None;
        }

        if now >= next.instant {
            let since = *self.arrived_since.get_or_insert(now);
            let first = trackers.claim(Subsystem::CountdownRefresh, &key);
            if first {
                tracing::info!(key = %key, "countdown reached prayer time");
            }
            let frame = CountdownFrame::arrived();
            self.last_frame = Some(frame.clone());
            return CountdownUpdate::Arrived {
                key,
                frame,
                first,
                held_for: now - since,
            };
        }

        let frame = tick_with(
            next,
            last_prayer_instant,
            now,
            self.final_hour,
            self.nominal_interval,
        );
        if frame.is_final_hour && trackers.claim(Subsystem::CountdownLog, &key) {
            tracing::debug!(key = %key, display = %frame.display, "final hour started");
        }
        self.last_frame = Some(frame.clone());
        CountdownUpdate::Running(frame)
    }

    pub fn frame(&self) -> Option<&CountdownFrame> {
        self.last_frame.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.arrived_since = None;
        self.last_frame = None;
    }
}
