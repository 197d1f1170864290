use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::arrival::{ArrivalAction, ArrivalMonitor, ArrivalPhase};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::countdown::{CountdownEngine, CountdownFrame, CountdownUpdate};
use crate::error::ScheduleError;
use crate::health::{HealthSupervisor, ScheduleHealth};
use crate::notifications::{
    NotificationCapability, NotificationHandle, NotificationSettings, SoundPreference,
};
use crate::prayer::{OccurrenceKey, PrayerName};
use crate::resolver::{last_prayer_instant, resolve_next_after, ResolvedNextPrayer};
use crate::scheduler::{NotificationScheduler, RescheduleOutcome, ScheduledNotificationSet};
use crate::store::{self, KeyValueStore, MemoryStore, LAST_SCHEDULE_ATTEMPT_KEY};
use crate::timetable::{DayTimeTable, TableOrigin, TimeTableSource};
use crate::tracking::{Subsystem, Trackers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RecoveryReason {
    /// Notifications were enabled but none were registered.
    MissingSchedule { expected: usize },
    /// The countdown sat at zero without the next prayer advancing.
    StuckCountdown { key: OccurrenceKey },
    /// Arrival handling could not advance past `key` even after a retry.
    StaleData { key: OccurrenceKey },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PrayerEvent {
    NextPrayerChanged { next: Option<ResolvedNextPrayer> },
    PrayerArrived { key: OccurrenceKey },
    ScheduleUpdated { outcome: RescheduleOutcome },
    PermissionDenied,
    RecoveryPerformed { reason: RecoveryReason },
    SettingsChanged { settings: NotificationSettings },
}

type Observer = Box<dyn Fn(&PrayerEvent) + Send + Sync>;

/// Snapshot of the scheduling state for diagnostics screens and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleDebugInfo {
    pub now: NaiveDateTime,
    pub date: NaiveDate,
    pub day_offset: i64,
    pub foreground: bool,
    pub table_origin: Option<TableOrigin>,
    pub settings: NotificationSettings,
    pub next: Option<ResolvedNextPrayer>,
    pub countdown: Option<CountdownFrame>,
    pub scheduled: ScheduledNotificationSet,
    /// Prayer notifications the platform reports, `None` if it could not be asked.
    pub platform_scheduled: Option<usize>,
    pub last_schedule_attempt: Option<NaiveDateTime>,
    pub cooling_down: bool,
    pub reschedule_pending: bool,
    pub handled: Option<OccurrenceKey>,
    pub trackers: Trackers,
    pub arrival: ArrivalPhase,
}

pub struct PrayerServiceBuilder {
    time_table: Option<Arc<dyn TimeTableSource>>,
    notifier: Option<Arc<dyn NotificationCapability>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl Default for PrayerServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PrayerServiceBuilder {
    pub fn new() -> Self {
        Self {
            time_table: None,
            notifier: None,
            store: None,
            clock: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_time_table(mut self, source: Arc<dyn TimeTableSource>) -> Self {
        self.time_table = Some(source);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationCapability>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads persisted settings, resolves the next prayer and runs the
    /// start-up reschedule.
    pub fn build(self) -> Result<PrayerService> {
        let time_table = self
            .time_table
            .ok_or_else(|| anyhow!("time table source not configured"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow!("notification capability not configured"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config;

        let now = clock.now();
        let settings = store::load_settings(store.as_ref());
        let mut scheduler = NotificationScheduler::new(&config);
        scheduler.restore_last_attempt(store::load_timestamp(
            store.as_ref(),
            LAST_SCHEDULE_ATTEMPT_KEY,
        ));

        let mut service = PrayerService {
            countdown: CountdownEngine::new(config.final_hour, config.nominal_interval),
            arrival: ArrivalMonitor::new(&config),
            health: HealthSupervisor::new(&config),
            next_settings_sync: now + config.settings_sync,
            config,
            time_table,
            notifier,
            store,
            clock,
            settings,
            date: now.date(),
            today: None,
            day_offset: 0,
            foreground: true,
            next: None,
            handled: None,
            trackers: Trackers::default(),
            scheduler,
            reschedule_pending: false,
            observers: Vec::new(),
        };
        service.refresh_table(now);
        service.update_next(now);
        if let Err(err) = service.request_reschedule(now) {
            warn!(%err, "start-up reschedule failed");
        }
        info!(date = %service.date, next = ?service.next.as_ref().map(|n| n.label()), "prayer service ready");
        Ok(service)
    }
}

/// Owns every component and the state they share. All entry points take
/// `&mut self`; the host drives it from a single task.
pub struct PrayerService {
    config: EngineConfig,
    time_table: Arc<dyn TimeTableSource>,
    notifier: Arc<dyn NotificationCapability>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: NotificationSettings,
    date: NaiveDate,
    today: Option<DayTimeTable>,
    day_offset: i64,
    foreground: bool,
    next: Option<ResolvedNextPrayer>,
    /// Latest occurrence the arrival path or a recovery moved past.
    handled: Option<OccurrenceKey>,
    trackers: Trackers,
    countdown: CountdownEngine,
    scheduler: NotificationScheduler,
    arrival: ArrivalMonitor,
    health: HealthSupervisor,
    next_settings_sync: NaiveDateTime,
    reschedule_pending: bool,
    observers: Vec<Observer>,
}

impl PrayerService {
    pub fn builder() -> PrayerServiceBuilder {
        PrayerServiceBuilder::new()
    }

    pub fn subscribe(&mut self, observer: impl Fn(&PrayerEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn next_prayer(&self) -> Option<&ResolvedNextPrayer> {
        self.next.as_ref()
    }

    pub fn countdown_display(&self) -> Option<&str> {
        self.countdown.frame().map(|frame| frame.display.as_str())
    }

    pub fn progress(&self) -> f64 {
        self.countdown.frame().map_or(0.0, |frame| frame.progress)
    }

    pub fn settings(&self) -> &NotificationSettings {
        &self.settings
    }

    pub fn scheduled(&self) -> &ScheduledNotificationSet {
        self.scheduler.current()
    }

    pub fn today(&self) -> Option<&DayTimeTable> {
        self.today.as_ref()
    }

    pub fn day_offset(&self) -> i64 {
        self.day_offset
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn schedule_debug_info(&self) -> ScheduleDebugInfo {
        let now = self.clock.now();
        ScheduleDebugInfo {
            now,
            date: self.date,
            day_offset: self.day_offset,
            foreground: self.foreground,
            table_origin: self.today.as_ref().map(DayTimeTable::origin),
            settings: self.settings.clone(),
            next: self.next.clone(),
            countdown: self.countdown.frame().cloned(),
            scheduled: self.scheduler.current().clone(),
            platform_scheduled: self.platform_scheduled(),
            last_schedule_attempt: self.scheduler.last_attempt(),
            cooling_down: self.scheduler.is_cooling_down(now),
            reschedule_pending: self.reschedule_pending,
            handled: self.handled,
            trackers: self.trackers.clone(),
            arrival: self.arrival.phase().clone(),
        }
    }

    /// One step of the foreground timeline. Call once per second.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if now.date() != self.date {
            self.change_day(now);
        }
        if !self.foreground {
            return;
        }
        self.run_countdown(now);
        self.run_arrival(now);
        self.run_health(now);
        if now >= self.next_settings_sync {
            self.next_settings_sync = now + self.config.settings_sync;
            self.sync_settings(now);
        }
        if self.reschedule_pending && !self.scheduler.is_cooling_down(now) {
            debug!("retrying deferred reschedule");
            self.try_reschedule(now, "deferred reschedule failed");
        }
    }

    #[instrument(skip(self))]
    pub fn set_notifications_enabled(
        &mut self,
        enabled: bool,
    ) -> Result<RescheduleOutcome, ScheduleError> {
        let now = self.clock.now();
        self.settings.enabled = enabled;
        self.settings_updated();
        if !enabled {
            self.scheduler.cancel_all(self.notifier.as_ref());
            self.reschedule_pending = false;
            self.emit(PrayerEvent::ScheduleUpdated {
                outcome: RescheduleOutcome::Disabled,
            });
            return Ok(RescheduleOutcome::Disabled);
        }
        self.scheduler.clear_cooldown();
        self.request_reschedule(now)
    }

    #[instrument(skip(self))]
    pub fn set_prayer_enabled(
        &mut self,
        prayer: PrayerName,
        enabled: bool,
    ) -> Result<RescheduleOutcome, ScheduleError> {
        let now = self.clock.now();
        self.settings.set_prayer(prayer, enabled);
        self.settings_updated();
        self.request_reschedule(now)
    }

    #[instrument(skip(self))]
    pub fn set_sound_preference(
        &mut self,
        sound: SoundPreference,
    ) -> Result<RescheduleOutcome, ScheduleError> {
        let now = self.clock.now();
        self.settings.sound = sound;
        self.settings_updated();
        self.request_reschedule(now)
    }

    /// Reloads the day's table and reschedules regardless of the cooldown.
    #[instrument(skip(self))]
    pub fn force_reschedule(&mut self) -> Result<RescheduleOutcome, ScheduleError> {
        let now = self.clock.now();
        self.refresh_table(now);
        self.update_next(now);
        self.scheduler.clear_cooldown();
        self.request_reschedule(now)
    }

    #[instrument(skip(self))]
    pub fn deliver_now(
        &mut self,
        prayer: PrayerName,
    ) -> Result<Option<NotificationHandle>, ScheduleError> {
        let now = self.clock.now();
        self.scheduler
            .deliver_now(self.notifier.as_ref(), prayer, &self.settings, now)
    }

    /// Switches between the live day (0) and a preview of another day.
    pub fn set_day_offset(&mut self, day_offset: i64) {
        if self.day_offset == day_offset {
            return;
        }
        let now = self.clock.now();
        self.day_offset = day_offset;
        self.countdown.clear();
        self.update_next(now);
    }

    #[instrument(skip(self))]
    pub fn on_resumed(&mut self) {
        let now = self.clock.now();
        self.foreground = true;
        self.arrival.resume();
        if now.date() != self.date {
            self.change_day(now);
        }
        self.sync_settings(now);
        self.refresh_table(now);
        self.update_next(now);

        let forced = store::take_force_flag(self.store.as_ref());
        let scheduled = self.scheduled_count();
        let verdict =
            HealthSupervisor::evaluate(now, &self.settings, self.today.as_ref(), scheduled);
        if forced || matches!(verdict, ScheduleHealth::MissingSchedule { .. }) {
            info!(forced, "rescheduling on resume");
            self.scheduler.clear_cooldown();
            self.try_reschedule(now, "reschedule on resume failed");
        }
    }

    #[instrument(skip(self))]
    pub fn on_backgrounded(&mut self) {
        self.foreground = false;
        self.arrival.pause();
    }

    #[instrument(skip(self))]
    pub fn on_day_changed(&mut self) {
        let now = self.clock.now();
        self.change_day(now);
    }

    /// Settings were written to the store by someone else.
    #[instrument(skip(self))]
    pub fn on_settings_changed(&mut self) {
        let now = self.clock.now();
        self.sync_settings(now);
    }

    /// The source reports new data; reload and reschedule.
    #[instrument(skip(self))]
    pub fn on_time_table_changed(&mut self) {
        let now = self.clock.now();
        self.refresh_table(now);
        self.update_next(now);
        self.scheduler.clear_cooldown();
        self.try_reschedule(now, "reschedule after time table change failed");
    }

    pub fn replace_time_table(&mut self, source: Arc<dyn TimeTableSource>) {
        self.time_table = source;
        self.on_time_table_changed();
    }

    fn emit(&self, event: PrayerEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }

    fn settings_updated(&mut self) {
        if let Err(err) = store::save_settings(self.store.as_ref(), &self.settings) {
            warn!(%err, "unable to persist notification settings");
        }
        self.emit(PrayerEvent::SettingsChanged {
            settings: self.settings.clone(),
        });
    }

    fn refresh_table(&mut self, now: NaiveDateTime) {
        self.date = now.date();
        self.today = self.time_table.lookup(self.date);
        match &self.today {
            Some(table) if table.origin() != TableOrigin::Local => {
                warn!(date = %self.date, origin = ?table.origin(), "using borrowed prayer times");
            }
            Some(_) => {}
            None => warn!(date = %self.date, "no prayer times for date"),
        }
    }

    fn lookup_offset(&self, days: i64) -> Option<DayTimeTable> {
        let date = self.date.checked_add_signed(Duration::days(days))?;
        self.time_table.lookup(date)
    }

    fn resolve(&self, now: NaiveDateTime) -> Option<ResolvedNextPrayer> {
        if self.day_offset != 0 {
            let table = self.lookup_offset(self.day_offset)?;
            return resolve_next_after(
                &table,
                None,
                now,
                self.day_offset,
                None,
                self.config.grace_window,
            );
        }
        let today = self.today.as_ref()?;
        let tomorrow = self.lookup_offset(1);
        resolve_next_after(
            today,
            tomorrow.as_ref(),
            now,
            0,
            self.handled.as_ref(),
            self.config.grace_window,
        )
    }

    fn update_next(&mut self, now: NaiveDateTime) {
        let next = self.resolve(now);
        if next == self.next {
            return;
        }
        debug!(
            from = ?self.next.as_ref().map(|n| n.key()),
            to = ?next.as_ref().map(|n| n.key()),
            "next prayer changed"
        );
        self.next = next;
        self.arrival.reset_polling();
        self.emit(PrayerEvent::NextPrayerChanged {
            next: self.next.clone(),
        });
    }

    fn last_prayer(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.day_offset != 0 {
            return None;
        }
        let today = self.today.as_ref()?;
        let yesterday = self.lookup_offset(-1);
        last_prayer_instant(today, yesterday.as_ref(), now)
    }

    fn platform_scheduled(&self) -> Option<usize> {
        match self.notifier.list_scheduled() {
            Ok(handles) => Some(handles.iter().filter(|h| h.is_prayer_handle()).count()),
            Err(err) => {
                debug!(%err, "unable to list scheduled notifications");
                None
            }
        }
    }

    fn scheduled_count(&self) -> usize {
        self.platform_scheduled()
            .unwrap_or_else(|| self.scheduler.current().len())
    }

    fn request_reschedule(
        &mut self,
        now: NaiveDateTime,
    ) -> Result<RescheduleOutcome, ScheduleError> {
        let Some(table) = self.today.as_ref() else {
            debug!(date = %self.date, "no table to schedule from");
            return Ok(RescheduleOutcome::NothingToSchedule);
        };
        let result =
            self.scheduler
                .reschedule(self.notifier.as_ref(), table, &mut self.settings, now);
        match &result {
            Ok(RescheduleOutcome::Suppressed) => {
                self.reschedule_pending = true;
            }
            Ok(outcome) => {
                self.reschedule_pending = false;
                self.persist_attempt();
                self.emit(PrayerEvent::ScheduleUpdated { outcome: *outcome });
            }
            Err(ScheduleError::PermissionDenied) => {
                self.reschedule_pending = false;
                self.persist_attempt();
                self.settings_updated();
                self.emit(PrayerEvent::PermissionDenied);
            }
            Err(err) => {
                warn!(%err, at = %now, "reschedule skipped this cycle");
                self.reschedule_pending = true;
                self.persist_attempt();
            }
        }
        result
    }

    fn try_reschedule(&mut self, now: NaiveDateTime, context: &'static str) {
        if let Err(err) = self.request_reschedule(now) {
            warn!(%err, "{context}");
        }
    }

    fn persist_attempt(&self) {
        if let Some(at) = self.scheduler.last_attempt() {
            if let Err(err) = store::save_timestamp(self.store.as_ref(), LAST_SCHEDULE_ATTEMPT_KEY, at)
            {
                warn!(%err, "unable to persist last schedule attempt");
            }
        }
    }

    fn sync_settings(&mut self, now: NaiveDateTime) {
        let Some(stored) = store::read_settings(self.store.as_ref()) else {
            return;
        };
        if stored == self.settings {
            return;
        }
        info!(enabled = stored.enabled, "notification settings changed externally");
        self.settings = stored;
        self.emit(PrayerEvent::SettingsChanged {
            settings: self.settings.clone(),
        });
        if self.settings.enabled {
            self.try_reschedule(now, "reschedule after settings change failed");
        } else {
            self.scheduler.cancel_all(self.notifier.as_ref());
            self.reschedule_pending = false;
        }
    }

    fn change_day(&mut self, now: NaiveDateTime) {
        info!(from = %self.date, to = %now.date(), "calendar day changed");
        self.handled = None;
        self.trackers.reset();
        self.countdown.clear();
        self.arrival.restart();
        self.refresh_table(now);
        self.update_next(now);
        self.scheduler.clear_cooldown();
        self.try_reschedule(now, "reschedule for new day failed");
    }

    fn run_countdown(&mut self, now: NaiveDateTime) {
        let Some(next) = self.next.clone() else {
            self.countdown.clear();
            return;
        };
        let last = self.last_prayer(now);
        let update = self.countdown.tick(&next, last, now, &mut self.trackers);
        if let CountdownUpdate::Arrived { key, held_for, .. } = update {
            if self.day_offset == 0
                && self
                    .health
                    .check_stuck(now, key, held_for, &mut self.trackers)
            {
                self.recover_stuck(now, key);
            }
        }
    }

    /// Full recovery for a countdown sitting at zero: clear the guards, move
    /// past the stuck occurrence, reload the table and reschedule only if
    /// that still did not help.
    fn recover_stuck(&mut self, now: NaiveDateTime, key: OccurrenceKey) {
        self.trackers.reset();
        // The safety slot outlives the reset so the re-arm window still applies.
        self.trackers.record(Subsystem::Safety, &key);
        self.countdown.clear();
        self.handled = Some(key);
        self.update_next(now);
        self.refresh_table(now);
        self.update_next(now);
        let still_stuck = self.next.as_ref().map_or(true, |next| next.instant <= now);
        if still_stuck {
            self.scheduler.clear_cooldown();
            self.try_reschedule(now, "reschedule during stuck recovery failed");
        }
        info!(key = %key, still_stuck, "stuck countdown recovered");
        self.emit(PrayerEvent::RecoveryPerformed {
            reason: RecoveryReason::StuckCountdown { key },
        });
    }

    fn run_arrival(&mut self, now: NaiveDateTime) {
        let action = self
            .arrival
            .poll(now, self.next.as_ref(), self.day_offset, &mut self.trackers);
        if let Some(action) = action {
            self.handle_arrival(now, action);
        }
    }

    fn advanced_past(&self, key: &OccurrenceKey) -> bool {
        self.next.as_ref().is_some_and(|next| next.key() != *key)
    }

    fn handle_arrival(&mut self, now: NaiveDateTime, action: ArrivalAction) {
        match action {
            ArrivalAction::Trigger(key) => {
                self.emit(PrayerEvent::PrayerArrived { key });
                self.scheduler.note_delivered(key.prayer, now);
                self.scheduler.clear_cooldown();
                self.handled = Some(key);
                self.update_next(now);
                self.try_reschedule(now, "reschedule after arrival failed");
            }
            ArrivalAction::Confirm(key) => {
                self.update_next(now);
                let advanced = self.advanced_past(&key);
                if !advanced {
                    let err = ScheduleError::StaleData { key };
                    warn!(%err, "next prayer did not advance, settling before retry");
                }
                self.arrival.confirm(now, key, advanced);
            }
            ArrivalAction::RetryAdvance(key) => {
                self.refresh_table(now);
                self.handled = Some(key);
                self.update_next(now);
                self.scheduler.clear_cooldown();
                self.try_reschedule(now, "reschedule on arrival retry failed");
                if !self.advanced_past(&key) {
                    let err = ScheduleError::StaleData { key };
                    warn!(%err, "still stale after retry, resuming normal polling");
                    self.emit(PrayerEvent::RecoveryPerformed {
                        reason: RecoveryReason::StaleData { key },
                    });
                }
            }
            ArrivalAction::Resumed => {
                debug!(next = ?self.next.as_ref().map(|n| n.key()), "arrival polling resumed");
            }
        }
    }

    fn run_health(&mut self, now: NaiveDateTime) {
        if !self.health.is_due(now) {
            return;
        }
        let scheduled = self.scheduled_count();
        let verdict =
            self.health
                .check_schedule(now, &self.settings, self.today.as_ref(), scheduled);
        if let ScheduleHealth::MissingSchedule { expected } = verdict {
            self.scheduler.clear_cooldown();
            self.try_reschedule(now, "reschedule for missing schedule failed");
            self.emit(PrayerEvent::RecoveryPerformed {
                reason: RecoveryReason::MissingSchedule { expected },
            });
        }
    }
}
