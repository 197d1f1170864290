//! Outer recovery layer: notices an empty schedule or a countdown stuck at
//! zero and tells the service to rerun the pipeline with its guards cleared.

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::notifications::NotificationSettings;
use crate::prayer::{OccurrenceKey, PrayerName};
use crate::timetable::DayTimeTable;
use crate::tracking::{Subsystem, Trackers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScheduleHealth {
    Healthy,
    /// Nothing is scheduled although `expected` prayers are still due today.
    MissingSchedule { expected: usize },
    /// Not due yet.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct HealthSupervisor {
    interval: Duration,
    stuck_grace: Duration,
    rearm: Duration,
    next_check_at: Option<NaiveDateTime>,
    last_safety_at: Option<NaiveDateTime>,
}

impl HealthSupervisor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            interval: config.health_interval,
            stuck_grace: config.stuck_grace,
            rearm: config.safety_rearm,
            next_check_at: None,
            last_safety_at: None,
        }
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.next_check_at.map_or(true, |due| now >= due)
    }

    /// Periodic check, rate limited to one per interval.
    pub fn check_schedule(
        &mut self,
        now: NaiveDateTime,
        settings: &NotificationSettings,
        table: Option<&DayTimeTable>,
        scheduled: usize,
    ) -> ScheduleHealth {
        if self.next_check_at.is_some_and(|due| now < due) {
            return ScheduleHealth::Skipped;
        }
        self.next_check_at = Some(now + self.interval);
        Self::evaluate(now, settings, table, scheduled)
    }

    /// Ad-hoc check outside the periodic cadence, e.g. on resume.
    pub fn evaluate(
        now: NaiveDateTime,
        settings: &NotificationSettings,
        table: Option<&DayTimeTable>,
        scheduled: usize,
    ) -> ScheduleHealth {
        if !settings.enabled || scheduled > 0 {
            return ScheduleHealth::Healthy;
        }
        let expected = table.map_or(0, |table| expected_notifications(settings, table, now));
        if expected == 0 {
            ScheduleHealth::Healthy
        } else {
            tracing::warn!(expected, "no notifications scheduled for remaining prayers");
            ScheduleHealth::MissingSchedule { expected }
        }
    }

    /// True when the countdown has shown the arrived state for `key` long
    /// enough to count as stuck and no recovery for it ran recently. The
    /// safety slot in `trackers` names the occurrence last recovered.
    pub fn check_stuck(
        &mut self,
        now: NaiveDateTime,
        key: OccurrenceKey,
        held_for: Duration,
        trackers: &mut Trackers,
    ) -> bool {
        if held_for < self.stuck_grace {
            return false;
        }
        if trackers.is_claimed(Subsystem::Safety, &key)
            && self.last_safety_at.is_some_and(|at| now - at < self.rearm)
        {
            return false;
        }
        trackers.record(Subsystem::Safety, &key);
        self.last_safety_at = Some(now);
        tracing::warn!(key = %key, held_secs = held_for.num_seconds(), "countdown stuck at prayer time");
        true
    }
}

/// Enabled prayers with a known time still ahead of `now`.
pub fn expected_notifications(
    settings: &NotificationSettings,
    table: &DayTimeTable,
    now: NaiveDateTime,
) -> usize {
    PrayerName::ALL
        .into_iter()
        .filter(|name| settings.is_prayer_enabled(*name))
        .filter_map(|name| table.instant(name))
        .filter(|instant| *instant > now)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn table() -> DayTimeTable {
        DayTimeTable::from_clock_strings(
            NaiveDate::from_ymd_opt(2025, 6, 14).unwrap(),
            ["03:17", "04:47", "11:39", "15:02", "18:30", "20:00"],
        )
        .unwrap()
    }

    #[test]
    fn empty_schedule_with_future_prayers_is_missing() {
        let mut health = HealthSupervisor::new(&EngineConfig::default());
        let settings = NotificationSettings::default();
        assert_eq!(
            health.check_schedule(at(12, 0, 0), &settings, Some(&table()), 0),
            ScheduleHealth::MissingSchedule { expected: 3 }
        );
        assert_eq!(
            health.check_schedule(at(12, 0, 30), &settings, Some(&table()), 0),
            ScheduleHealth::Skipped
        );
        assert_eq!(
            health.check_schedule(at(12, 1, 0), &settings, Some(&table()), 3),
            ScheduleHealth::Healthy
        );
    }

    #[test]
    fn disabled_or_finished_days_are_healthy() {
        let mut settings = NotificationSettings::default();
        assert_eq!(
            HealthSupervisor::evaluate(at(21, 0, 0), &settings, Some(&table()), 0),
            ScheduleHealth::Healthy
        );
        settings.enabled = false;
        assert_eq!(
            HealthSupervisor::evaluate(at(12, 0, 0), &settings, Some(&table()), 0),
            ScheduleHealth::Healthy
        );
    }

    #[test]
    fn stuck_recovery_fires_once_then_rearms() {
        let mut health = HealthSupervisor::new(&EngineConfig::default());
        let mut trackers = Trackers::default();
        let key = OccurrenceKey::new(PrayerName::Asr, at(15, 2, 0));

        assert!(!health.check_stuck(at(15, 2, 10), key, Duration::seconds(10), &mut trackers));
        assert!(health.check_stuck(at(15, 2, 20), key, Duration::seconds(20), &mut trackers));
        assert!(trackers.is_claimed(Subsystem::Safety, &key));
        assert!(!health.check_stuck(at(15, 2, 40), key, Duration::seconds(40), &mut trackers));
        assert!(health.check_stuck(at(15, 2, 50), key, Duration::seconds(50), &mut trackers));
    }

    #[test]
    fn rearm_only_holds_back_the_recovered_occurrence() {
        let mut health = HealthSupervisor::new(&EngineConfig::default());
        let mut trackers = Trackers::default();
        let asr = OccurrenceKey::new(PrayerName::Asr, at(15, 2, 0));
        let maghrib = OccurrenceKey::new(PrayerName::Maghrib, at(18, 30, 0));

        assert!(health.check_stuck(at(15, 2, 20), asr, Duration::seconds(20), &mut trackers));
        assert!(health.check_stuck(at(15, 2, 25), maghrib, Duration::seconds(20), &mut trackers));
        assert!(trackers.is_claimed(Subsystem::Safety, &maghrib));
        assert!(!trackers.is_claimed(Subsystem::Safety, &asr));
    }
}
