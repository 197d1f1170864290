use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CapabilityError, ScheduleError};
use crate::notifications::{
    AlertProfile, NotificationCapability, NotificationHandle, NotificationRequest,
    NotificationSettings,
};
use crate::prayer::PrayerName;
use crate::timetable::DayTimeTable;
use crate::tracking::{Cooldown, KeyedCooldown};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledNotification {
    pub handle: NotificationHandle,
    pub prayer: PrayerName,
    pub instant: NaiveDateTime,
    pub profile: AlertProfile,
}

/// Live platform notifications for one day, at most one per prayer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduledNotificationSet {
    pub date: Option<NaiveDate>,
    pub created_at: Option<NaiveDateTime>,
    pub entries: Vec<ScheduledNotification>,
}

impl ScheduledNotificationSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, prayer: PrayerName) -> bool {
        self.entries.iter().any(|entry| entry.prayer == prayer)
    }

    pub fn handles(&self) -> impl Iterator<Item = &NotificationHandle> {
        self.entries.iter().map(|entry| &entry.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RescheduleOutcome {
    /// A fresh set replaced the previous one.
    Scheduled(usize),
    /// Inside the attempt cooldown; the previous set is untouched.
    Suppressed,
    /// Notifications are switched off.
    Disabled,
    /// Previous set cancelled, nothing left to schedule today.
    NothingToSchedule,
}

/// Owns the live [`ScheduledNotificationSet`] and every write to it.
#[derive(Debug)]
pub struct NotificationScheduler {
    current: ScheduledNotificationSet,
    attempt: Cooldown,
    delivery: KeyedCooldown<PrayerName>,
}

impl NotificationScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            current: ScheduledNotificationSet::default(),
            attempt: Cooldown::new(config.schedule_cooldown),
            delivery: KeyedCooldown::new(config.delivery_cooldown),
        }
    }

    pub fn current(&self) -> &ScheduledNotificationSet {
        &self.current
    }

    pub fn last_attempt(&self) -> Option<NaiveDateTime> {
        self.attempt.last()
    }

    pub fn restore_last_attempt(&mut self, last: Option<NaiveDateTime>) {
        self.attempt.restore(last);
    }

    /// Lifts the attempt cooldown so the next reschedule runs.
    pub fn clear_cooldown(&mut self) {
        self.attempt.clear();
    }

    pub fn is_cooling_down(&self, now: NaiveDateTime) -> bool {
        self.attempt.is_active(now)
    }

    /// Cancels the whole previous set and registers one notification per
    /// enabled, known, future prayer of `table`.
    pub fn reschedule(
        &mut self,
        capability: &dyn NotificationCapability,
        table: &DayTimeTable,
        settings: &mut NotificationSettings,
        now: NaiveDateTime,
    ) -> Result<RescheduleOutcome, ScheduleError> {
        if !settings.enabled {
            return Ok(RescheduleOutcome::Disabled);
        }
        if self.attempt.is_active(now) {
            debug!(last = ?self.attempt.last(), "reschedule suppressed by cooldown");
            return Ok(RescheduleOutcome::Suppressed);
        }
        self.attempt.mark(now);

        match capability.request_permission() {
            Ok(true) => {}
            Ok(false) | Err(CapabilityError::PermissionDenied) => {
                warn!("notification permission denied, disabling notifications");
                settings.enabled = false;
                self.cancel_all(capability);
                return Err(ScheduleError::PermissionDenied);
            }
            Err(err) => {
                warn!(%err, "permission check failed, skipping cycle");
                return Err(err.into());
            }
        }

        let mut due = Vec::new();
        for name in PrayerName::ALL {
            if !settings.is_prayer_enabled(name) {
                continue;
            }
            match table.instant(name) {
                Some(instant) if instant > now => due.push((name, instant)),
                Some(_) => {}
                None => {
                    let err = ScheduleError::UnknownTime {
                        prayer: name,
                        date: table.date(),
                    };
                    debug!(%err, "not schedulable");
                }
            }
        }

        self.cancel_all(capability);
        self.current.date = Some(table.date());
        self.current.created_at = Some(now);

        if due.is_empty() {
            debug!(date = %table.date(), "no future prayers left to schedule");
            return Ok(RescheduleOutcome::NothingToSchedule);
        }

        for (prayer, instant) in due {
            let request = NotificationRequest::for_prayer(prayer, instant, settings.sound);
            match capability.schedule_at(&request) {
                Ok(handle) => self.current.entries.push(ScheduledNotification {
                    handle,
                    prayer,
                    instant,
                    profile: request.profile,
                }),
                Err(err) => {
                    warn!(prayer = %prayer, %err, "failed to register notification, continuing");
                }
            }
        }

        info!(
            date = %table.date(),
            count = self.current.len(),
            "prayer notifications scheduled"
        );
        Ok(RescheduleOutcome::Scheduled(self.current.len()))
    }

    /// Cancels every handle this scheduler owns plus any prayer handle the
    /// platform still lists, e.g. from before a restart.
    pub fn cancel_all(&mut self, capability: &dyn NotificationCapability) {
        let mut handles: BTreeSet<NotificationHandle> = self.current.handles().cloned().collect();
        match capability.list_scheduled() {
            Ok(listed) => handles.extend(listed.into_iter().filter(|h| h.is_prayer_handle())),
            Err(err) => warn!(%err, "unable to list scheduled notifications"),
        }
        for handle in &handles {
            if let Err(err) = capability.cancel(handle) {
                warn!(handle = handle.as_str(), %err, "failed to cancel notification");
            }
        }
        self.current = ScheduledNotificationSet::default();
    }

    /// Fires a single notification right away. Skips the attempt cooldown and
    /// leaves the scheduled set alone. Returns `None` when the same prayer was
    /// delivered within the delivery cooldown.
    pub fn deliver_now(
        &mut self,
        capability: &dyn NotificationCapability,
        prayer: PrayerName,
        settings: &NotificationSettings,
        now: NaiveDateTime,
    ) -> Result<Option<NotificationHandle>, ScheduleError> {
        if self.delivery.is_active(&prayer, now) {
            debug!(prayer = %prayer, "immediate delivery suppressed by cooldown");
            return Ok(None);
        }
        if !capability.request_permission()? {
            return Err(ScheduleError::PermissionDenied);
        }
        let request = NotificationRequest::immediate(prayer, now, settings.sound);
        let handle = capability.schedule_at(&request)?;
        self.delivery.mark(prayer, now);
        info!(prayer = %prayer, handle = handle.as_str(), "immediate notification delivered");
        Ok(Some(handle))
    }

    /// Records that the platform alerted the user for `prayer`.
    pub fn note_delivered(&mut self, prayer: PrayerName, now: NaiveDateTime) {
        self.delivery.mark(prayer, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{MemoryNotifier, SoundPreference};
    use chrono::Duration;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        date().and_hms_opt(h, m, 0).unwrap()
    }

    fn table() -> DayTimeTable {
        DayTimeTable::from_clock_strings(
            date(),
            ["03:17", "04:47", "11:39", "15:02", "18:30", "20:00"],
        )
        .unwrap()
    }

    fn scheduler() -> NotificationScheduler {
        NotificationScheduler::new(&EngineConfig::default())
    }

    #[test]
    fn schedules_only_enabled_future_prayers() {
        let notifier = MemoryNotifier::new();
        let mut settings = NotificationSettings::default();
        let mut scheduler = scheduler();

        let outcome = scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 0))
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Scheduled(3));
        let prayers: Vec<_> = notifier.pending().iter().map(|r| r.prayer).collect();
        assert_eq!(
            prayers,
            vec![PrayerName::Asr, PrayerName::Maghrib, PrayerName::Isha]
        );
    }

    #[test]
    fn second_call_inside_cooldown_is_a_no_op() {
        let notifier = MemoryNotifier::new();
        let mut settings = NotificationSettings::default();
        let mut scheduler = scheduler();

        scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 0))
            .unwrap();
        let before = scheduler.current().clone();
        let calls = notifier.schedule_calls();

        let outcome = scheduler
            .reschedule(
                &notifier,
                &table(),
                &mut settings,
                at(12, 0) + Duration::seconds(4),
            )
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Suppressed);
        assert_eq!(scheduler.current(), &before);
        assert_eq!(notifier.schedule_calls(), calls);

        scheduler.clear_cooldown();
        let outcome = scheduler
            .reschedule(
                &notifier,
                &table(),
                &mut settings,
                at(12, 0) + Duration::seconds(4),
            )
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Scheduled(3));
    }

    #[test]
    fn repeated_reschedules_never_duplicate_handles() {
        let notifier = MemoryNotifier::new();
        let mut settings = NotificationSettings::default();
        let mut scheduler = scheduler();
        for minute in [0, 1, 2] {
            scheduler
                .reschedule(&notifier, &table(), &mut settings, at(12, minute))
                .unwrap();
        }
        assert_eq!(notifier.list_scheduled().unwrap().len(), 3);
    }

    #[test]
    fn orphans_from_a_previous_process_are_cancelled() {
        let notifier = MemoryNotifier::new();
        let stale = NotificationRequest::for_prayer(
            PrayerName::Dhuhr,
            at(13, 0),
            SoundPreference::Azan,
        );
        notifier.schedule_at(&stale).unwrap();

        let mut settings = NotificationSettings::only(&[PrayerName::Isha]);
        let mut scheduler = scheduler();
        scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 0))
            .unwrap();
        let pending = notifier.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prayer, PrayerName::Isha);
    }

    #[test]
    fn permission_denied_disables_and_clears() {
        let notifier = MemoryNotifier::new();
        let mut settings = NotificationSettings::default();
        let mut scheduler = scheduler();
        scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 0))
            .unwrap();

        notifier.set_permission(false);
        scheduler.clear_cooldown();
        let err = scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 1))
            .unwrap_err();
        assert_eq!(err, ScheduleError::PermissionDenied);
        assert!(!settings.enabled);
        assert!(notifier.list_scheduled().unwrap().is_empty());
        assert!(scheduler.current().is_empty());

        let outcome = scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 10))
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Disabled);
    }

    #[test]
    fn individual_failures_do_not_abort_the_batch() {
        let notifier = MemoryNotifier::new();
        notifier.fail_for(PrayerName::Maghrib);
        let mut settings = NotificationSettings::default();
        let mut scheduler = scheduler();
        let outcome = scheduler
            .reschedule(&notifier, &table(), &mut settings, at(12, 0))
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Scheduled(2));
        assert!(!scheduler.current().contains(PrayerName::Maghrib));
        assert!(settings.enabled);
    }

    #[test]
    fn sound_profile_follows_prayer_and_preference() {
        let notifier = MemoryNotifier::new();
        let mut settings = NotificationSettings::only(&[PrayerName::Sunrise, PrayerName::Dhuhr]);
        let mut scheduler = scheduler();
        scheduler
            .reschedule(&notifier, &table(), &mut settings, at(1, 0))
            .unwrap();
        let profiles: Vec<_> = scheduler
            .current()
            .entries
            .iter()
            .map(|entry| (entry.prayer, entry.profile))
            .collect();
        assert_eq!(
            profiles,
            vec![
                (PrayerName::Sunrise, AlertProfile::Short),
                (PrayerName::Dhuhr, AlertProfile::Azan)
            ]
        );
    }

    #[test]
    fn after_isha_nothing_is_left_to_schedule() {
        let notifier = MemoryNotifier::new();
        let mut settings = NotificationSettings::default();
        let mut scheduler = scheduler();
        let outcome = scheduler
            .reschedule(&notifier, &table(), &mut settings, at(21, 0))
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::NothingToSchedule);
        assert!(notifier.pending().is_empty());
    }

    #[test]
    fn deliver_now_respects_delivery_cooldown_only() {
        let notifier = MemoryNotifier::new();
        let settings = NotificationSettings::default();
        let mut scheduler = scheduler();
        let first = scheduler
            .deliver_now(&notifier, PrayerName::Asr, &settings, at(15, 2))
            .unwrap();
        assert!(first.is_some());
        let again = scheduler
            .deliver_now(
                &notifier,
                PrayerName::Asr,
                &settings,
                at(15, 2) + Duration::seconds(30),
            )
            .unwrap();
        assert!(again.is_none());
        let other = scheduler
            .deliver_now(
                &notifier,
                PrayerName::Maghrib,
                &settings,
                at(15, 2) + Duration::seconds(30),
            )
            .unwrap();
        assert!(other.is_some());
        assert!(scheduler.current().is_empty());
    }
}
