use std::collections::HashMap;
use std::hash::Hash;

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::prayer::OccurrenceKey;

/// Minimum interval between repeated side effects of one kind.
#[derive(Debug, Clone, Serialize)]
pub struct Cooldown {
    #[serde(skip)]
    window: Duration,
    last: Option<NaiveDateTime>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        self.last
            .is_some_and(|last| now >= last && now - last < self.window)
    }

    pub fn mark(&mut self, now: NaiveDateTime) {
        self.last = Some(now);
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<NaiveDateTime> {
        self.last
    }

    pub(crate) fn restore(&mut self, last: Option<NaiveDateTime>) {
        self.last = last;
    }
}

/// Per-key cooldowns, e.g. one delivery window per prayer.
#[derive(Debug, Clone)]
pub struct KeyedCooldown<K> {
    window: Duration,
    last: HashMap<K, NaiveDateTime>,
}

impl<K: Eq + Hash> KeyedCooldown<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn is_active(&self, key: &K, now: NaiveDateTime) -> bool {
        self.last
            .get(key)
            .is_some_and(|last| now >= *last && now - *last < self.window)
    }

    pub fn mark(&mut self, key: K, now: NaiveDateTime) {
        self.last.insert(key, now);
    }
}

/// The subsystems that keep an idempotence slot in [`Trackers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Arrival,
    CountdownLog,
    CountdownRefresh,
    Safety,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Arrival => "arrival",
            Subsystem::CountdownLog => "countdown-log",
            Subsystem::CountdownRefresh => "countdown-refresh",
            Subsystem::Safety => "safety",
        }
    }
}

/// Idempotence tags, one slot per subsystem. A slot holds the tag of the last
/// occurrence that subsystem handled.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Trackers {
    pub last_triggered: Option<String>,
    pub last_countdown_log: Option<String>,
    pub countdown_refresh: Option<String>,
    pub safety_triggered: Option<String>,
}

impl Trackers {
    pub fn reset(&mut self) {
        *self = Trackers::default();
    }

    fn slot(&self, subsystem: Subsystem) -> &Option<String> {
        match subsystem {
            Subsystem::Arrival => &self.last_triggered,
            Subsystem::CountdownLog => &self.last_countdown_log,
            Subsystem::CountdownRefresh => &self.countdown_refresh,
            Subsystem::Safety => &self.safety_triggered,
        }
    }

    fn slot_mut(&mut self, subsystem: Subsystem) -> &mut Option<String> {
        match subsystem {
            Subsystem::Arrival => &mut self.last_triggered,
            Subsystem::CountdownLog => &mut self.last_countdown_log,
            Subsystem::CountdownRefresh => &mut self.countdown_refresh,
            Subsystem::Safety => &mut self.safety_triggered,
        }
    }

    /// Records `key` in the slot for `subsystem`. Returns false when that
    /// occurrence was already recorded there.
    pub fn claim(&mut self, subsystem: Subsystem, key: &OccurrenceKey) -> bool {
        if self.is_claimed(subsystem, key) {
            return false;
        }
        self.record(subsystem, key);
        true
    }

    /// Overwrites the slot for `subsystem` with `key`.
    pub fn record(&mut self, subsystem: Subsystem, key: &OccurrenceKey) {
        *self.slot_mut(subsystem) = Some(key.tracker_tag(subsystem.as_str()));
    }

    pub fn is_claimed(&self, subsystem: Subsystem, key: &OccurrenceKey) -> bool {
        let tag = key.tracker_tag(subsystem.as_str());
        self.slot(subsystem).as_deref() == Some(tag.as_str())
    }
}
